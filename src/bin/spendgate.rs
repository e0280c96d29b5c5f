use std::collections::BTreeMap;
use std::sync::Arc;

use spendgate::{
    CostLedger, Gateway, GatewayHttpState, HttpBackend, KeyStateFile, KeyStore, MemoryLedger,
    Pricing,
};

const USAGE: &str = "usage: spendgate --upstream URL [--listen HOST:PORT] [--admin-token TOKEN] \
[--state PATH] [--upstream-header name=value] [--pricing-litellm PATH] [--json-logs] \
[--redis URL] [--redis-prefix PREFIX]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);

    let mut listen = "127.0.0.1:8080".to_string();
    let mut upstream_url: Option<String> = None;
    let mut upstream_headers: BTreeMap<String, String> = BTreeMap::new();
    let mut admin_token: Option<String> = None;
    let mut state_path: Option<std::path::PathBuf> = None;
    let mut pricing_path: Option<String> = None;
    let mut json_logs = false;
    let mut redis_url: Option<String> = None;
    let mut redis_prefix: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--upstream" => {
                upstream_url = Some(args.next().ok_or("missing value for --upstream")?);
            }
            "--upstream-header" => {
                let spec = args.next().ok_or("missing value for --upstream-header")?;
                let (name, value) = spec
                    .split_once('=')
                    .ok_or("upstream header spec must be name=value")?;
                upstream_headers.insert(name.to_string(), value.to_string());
            }
            "--admin-token" => {
                admin_token = Some(args.next().ok_or("missing value for --admin-token")?);
            }
            "--state" => {
                state_path = Some(args.next().ok_or("missing value for --state")?.into());
            }
            "--pricing-litellm" => {
                pricing_path = Some(args.next().ok_or("missing value for --pricing-litellm")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            "--redis" => {
                redis_url = Some(args.next().ok_or("missing value for --redis")?);
            }
            "--redis-prefix" => {
                redis_prefix = Some(args.next().ok_or("missing value for --redis-prefix")?);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => {
                return Err(format!("unknown flag: {other}\n{USAGE}").into());
            }
        }
    }

    let upstream_url = upstream_url.ok_or(USAGE)?;

    let mut backend = HttpBackend::new(upstream_url)?.with_headers(upstream_headers);
    if let Some(path) = pricing_path {
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| format!("read pricing file {path} failed: {err}"))?;
        backend = backend.with_pricing(Pricing::from_litellm_json_str(&raw)?);
    }

    let keys = Arc::new(KeyStore::new());

    #[cfg(not(feature = "store-redis"))]
    if redis_url.is_some() || redis_prefix.is_some() {
        return Err("redis storage requires `--features store-redis`".into());
    }

    #[cfg(feature = "store-redis")]
    let redis_store = match redis_url {
        Some(url) => {
            let mut store = spendgate::RedisStore::new(url)?;
            if let Some(prefix) = redis_prefix {
                store = store.with_prefix(prefix);
            }
            for key in store.load_keys().await? {
                keys.register(key)?;
            }
            Some(store)
        }
        None => None,
    };

    #[cfg(feature = "store-redis")]
    let use_redis_ledger = redis_store.is_some();
    #[cfg(not(feature = "store-redis"))]
    let use_redis_ledger = false;

    if let Some(path) = state_path.as_ref() {
        if !use_redis_ledger && path.exists() {
            for key in KeyStateFile::load(path)?.keys {
                keys.register(key)?;
            }
        }
    }

    #[cfg(feature = "store-redis")]
    let ledger: Arc<dyn CostLedger> = match redis_store.as_ref() {
        Some(store) => Arc::new(store.clone()),
        None => Arc::new(MemoryLedger::new()),
    };
    #[cfg(not(feature = "store-redis"))]
    let ledger: Arc<dyn CostLedger> = Arc::new(MemoryLedger::new());

    let gateway = Gateway::new(keys, ledger, Arc::new(backend));
    let mut state = GatewayHttpState::new(gateway);
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }
    if let Some(path) = state_path {
        state = state.with_state_file(path);
    }
    #[cfg(feature = "store-redis")]
    if let Some(store) = redis_store {
        state = state.with_redis_store(store);
    }
    if json_logs {
        state = state.with_json_logs();
    }

    let app = spendgate::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    println!("spendgate listening on {listen}");
    axum::serve(listener, app).await?;
    Ok(())
}
