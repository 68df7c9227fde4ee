use std::sync::Arc;

use crate::error::Result;
use crate::services::{
    AdGuardClient, Credentials, DisabledFetcher, FlareSolverrClient, NftSets, PageFetcher,
    UciPolicySource,
};
use crate::sync::{Collaborators, EngineSettings, SyncEngine, TargetRegistry};
use crate::utils::env::EnvVars;

pub struct AppState {
    pub env_vars: EnvVars,
    pub adguard: Arc<AdGuardClient>,
    pub engine: Arc<SyncEngine>,
}

/// Build the clients and the engine from configuration.
pub fn init_app_state(env_vars: EnvVars) -> Result<AppState> {
    let http_client = reqwest::Client::builder()
        .timeout(env_vars.http_timeout())
        .build()?;

    let credentials = match (&env_vars.adguard_user, &env_vars.adguard_pass) {
        (Some(username), Some(password)) => Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        }),
        _ => {
            log::info!("No AdGuard credentials configured, querying without login");
            None
        }
    };
    let adguard = Arc::new(AdGuardClient::new(
        http_client.clone(),
        env_vars.adguard_url.clone(),
        credentials,
    ));

    let sets = Arc::new(NftSets::new(
        &env_vars.nft_table,
        env_vars.pbr_init_script.clone(),
        env_vars.command_timeout(),
    ));
    let policies = Arc::new(UciPolicySource::new(
        env_vars.pbr_uci_package.clone(),
        env_vars.command_timeout(),
    ));

    // The proxy gets its own per-request timeout, see FlareSolverrClient::fetch
    let fetcher: Arc<dyn PageFetcher> = if env_vars.warm_start_enabled {
        log::info!("Warm-start enabled via FlareSolverr at {}", env_vars.flaresolverr_url);
        Arc::new(FlareSolverrClient::new(
            reqwest::Client::new(),
            env_vars.flaresolverr_url.clone(),
            std::time::Duration::from_millis(env_vars.flaresolverr_timeout_ms),
        ))
    } else {
        Arc::new(DisabledFetcher)
    };

    let engine = Arc::new(SyncEngine::new(
        Arc::new(TargetRegistry::new()),
        Collaborators {
            query_log: adguard.clone(),
            policies,
            sets,
            fetcher,
        },
        EngineSettings::from_env(&env_vars),
    ));

    Ok(AppState {
        env_vars,
        adguard,
        engine,
    })
}
