//! Functions callable from templates.
//!
//! - `timestamp()`: the current time, RFC 3339 in UTC.
//! - `lookup(app)`: instances of another app on the private network, as
//!   `{name, ips, alloc_ids, vm_addrs}`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use minijinja::{Environment, Error, ErrorKind, Value};
use serde::Serialize;
use tokio::runtime::Handle;

use crate::discovery::Discovery;
use crate::error::DiscoveryError;

/// Bound on a single `lookup` call.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// What `lookup(app)` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppVars {
    pub name: String,
    pub ips: Vec<String>,
    pub alloc_ids: Vec<String>,
    /// `<alloc id>.vm.<app>.internal` for every allocation.
    pub vm_addrs: Vec<String>,
}

pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

pub async fn lookup_app(discovery: &dyn Discovery, app: &str) -> Result<AppVars, DiscoveryError> {
    let alloc_ids = discovery.peer_alloc_ids(app).await?;
    let vm_addrs = alloc_ids
        .iter()
        .map(|id| format!("{}.vm.{}.internal", id, app))
        .collect();
    let ips = discovery
        .peer_ips(app)
        .await?
        .iter()
        .map(ToString::to_string)
        .collect();
    Ok(AppVars {
        name: app.to_string(),
        ips,
        alloc_ids,
        vm_addrs,
    })
}

/// Installs `timestamp` and `lookup` into `env`.
///
/// `lookup` blocks on `runtime`, so templates using it must be rendered off
/// the async worker threads.
pub(super) fn register(
    env: &mut Environment<'static>,
    discovery: Arc<dyn Discovery>,
    runtime: Option<Handle>,
    timeout: Duration,
) {
    env.add_function("timestamp", timestamp);
    env.add_function("lookup", move |app: String| -> Result<Value, Error> {
        let runtime = runtime.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "lookup needs an async runtime")
        })?;
        let discovery = Arc::clone(&discovery);
        let query = app.clone();
        let found = runtime.block_on(async move {
            tokio::time::timeout(timeout, lookup_app(discovery.as_ref(), &query)).await
        });
        match found {
            Ok(Ok(vars)) => Ok(Value::from_serialize(&vars)),
            Ok(Err(err)) => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("lookup {}: {}", app, err),
            )
            .with_source(err)),
            Err(_) => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("lookup {}: timed out after {:?}", app, timeout),
            )),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::tests::FakeDiscovery;
    use std::collections::HashMap;

    #[test]
    fn timestamp_is_rfc3339() {
        let ts = timestamp();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok(), "{}", ts);
    }

    #[tokio::test]
    async fn lookup_builds_vm_addresses() {
        let discovery = FakeDiscovery {
            ips: HashMap::from([("db".to_string(), vec!["fdaa::7".parse().unwrap()])]),
            allocs: HashMap::from([("db".to_string(), vec!["a1b2c3d4".into(), "e5f6a7b8".into()])]),
            ..FakeDiscovery::default()
        };
        let vars = lookup_app(&discovery, "db").await.unwrap();
        assert_eq!(vars.name, "db");
        assert_eq!(vars.ips, vec!["fdaa::7"]);
        assert_eq!(
            vars.vm_addrs,
            vec!["a1b2c3d4.vm.db.internal", "e5f6a7b8.vm.db.internal"]
        );
    }

    #[test]
    fn lookup_without_runtime_is_a_template_error() {
        let mut env = Environment::new();
        register(&mut env, Arc::new(FakeDiscovery::default()), None, LOOKUP_TIMEOUT);
        let err = env
            .render_str("{{ lookup('db').name }}", ())
            .unwrap_err();
        assert!(err.to_string().contains("lookup needs an async runtime"), "{}", err);
    }
}
