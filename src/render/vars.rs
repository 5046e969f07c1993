//! The value tree handed to every template.
//!
//! ```text
//! env.*      process environment
//! fly.*      instance identity and peers
//! procfly.*  procfly directory and config file
//! ```

use std::collections::BTreeMap;
use std::ffi::OsString;

use serde::Serialize;

use crate::discovery::{Discovery, LOCAL_ALLOC_ID, PRIVATE_HOST};
use crate::error::RenderError;
use crate::paths::Paths;

const LOCAL: &str = "local";
const LOCAL_IP: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vars {
    pub env: BTreeMap<String, String>,
    pub fly: FlyVars,
    pub procfly: ProcflyVars,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlyVars {
    /// `localhost`, or the private network hostname when deployed.
    pub host: String,
    pub app_name: String,
    /// Region this instance runs in.
    pub region: String,
    /// Every region the app runs in, sorted.
    pub all_regions: Vec<String>,
    /// This instance's private address.
    pub ip: String,
    /// Private addresses of every instance, sorted.
    pub peer_ips: Vec<String>,
    /// Full allocation id.
    pub server_name: String,
    /// First 8 characters of `server_name`.
    pub alloc_id: String,
    /// Short allocation ids of every instance, sorted, always including `alloc_id`.
    pub peer_alloc_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcflyVars {
    pub root: String,
    pub file: String,
}

impl Vars {
    /// Builds the value tree from `env`, asking `discovery` about peers when
    /// `FLY_APP_NAME` is set.
    pub async fn load(
        env: BTreeMap<String, String>,
        paths: &Paths,
        discovery: &dyn Discovery,
    ) -> Result<Self, RenderError> {
        let fly = FlyVars::load(&env, discovery).await?;
        Ok(Self {
            env,
            fly,
            procfly: ProcflyVars {
                root: paths.root.display().to_string(),
                file: paths.config_file.display().to_string(),
            },
        })
    }
}

impl FlyVars {
    /// Identity of an undeployed instance.
    pub fn local(server_name: &str, region: &str) -> Self {
        let alloc_id = short_id(server_name);
        Self {
            host: "localhost".to_string(),
            app_name: LOCAL.to_string(),
            region: region.to_string(),
            all_regions: vec![LOCAL.to_string()],
            ip: LOCAL_IP.to_string(),
            peer_ips: vec![LOCAL_IP.to_string()],
            server_name: server_name.to_string(),
            peer_alloc_ids: vec![alloc_id.clone()],
            alloc_id,
        }
    }

    async fn load(
        env: &BTreeMap<String, String>,
        discovery: &dyn Discovery,
    ) -> Result<Self, RenderError> {
        let var = |key: &str| env.get(key).filter(|v| !v.is_empty());
        let server_name = var("FLY_ALLOC_ID").map_or(LOCAL_ALLOC_ID, String::as_str);
        let region = var("FLY_REGION").map_or(LOCAL, String::as_str);

        let Some(app) = var("FLY_APP_NAME") else {
            return Ok(Self::local(server_name, region));
        };

        let alloc_id = short_id(server_name);

        let mut all_regions = discovery.regions(app).await?;
        all_regions.sort();
        all_regions.dedup();

        let ip = discovery.private_ip().await;

        let mut peer_ips = discovery.peer_ips(app).await?;
        peer_ips.sort();
        peer_ips.dedup();

        let mut peer_alloc_ids = discovery.peer_alloc_ids(app).await?;
        peer_alloc_ids.push(alloc_id.clone());
        peer_alloc_ids.sort();
        peer_alloc_ids.dedup();

        Ok(Self {
            host: PRIVATE_HOST.to_string(),
            app_name: app.clone(),
            region: region.to_string(),
            all_regions,
            ip: ip.to_string(),
            peer_ips: peer_ips.iter().map(ToString::to_string).collect(),
            server_name: server_name.to_string(),
            alloc_id,
            peer_alloc_ids,
        })
    }
}

fn short_id(server_name: &str) -> String {
    server_name.chars().take(8).collect()
}

/// The current process environment. Entries that are not valid UTF-8 are skipped.
pub fn process_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v): (OsString, OsString)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}
