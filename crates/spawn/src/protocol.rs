//! Wire encoding for the spawn-server control channel.
//!
//! Pure encode/decode helpers with no I/O of their own, so both
//! [`crate::manager::SpawnManager`] and the in-process fake spawn server
//! in [`crate::testing`] build frames the same way.

use apppool_core::SpawnOptions;

/// `["spawn_application", appRoot, "true"|"false", lowestUser, environment,
/// spawnMethod, appType]`
pub fn spawn_application_args(options: &SpawnOptions) -> Vec<String> {
    vec![
        "spawn_application".to_string(),
        options.app_root.to_string(),
        bool_str(options.lower_privilege).to_string(),
        options.lowest_user.clone(),
        options.environment.clone(),
        options.spawn_method.as_wire_str().to_string(),
        options.app_type.as_wire_str().to_string(),
    ]
}

/// `["reload", appRoot]`
pub fn reload_args(app_root: &str) -> Vec<String> {
    vec!["reload".to_string(), app_root.to_string()]
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

pub fn parse_bool_str(s: &str) -> bool {
    s == "true"
}

/// The `[pid, listenerAddress, usingAbstractNamespace]` reply that follows
/// a `["ok"]` spawn reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedInstanceInfo {
    pub pid: u32,
    pub listener_address: String,
    pub using_abstract_namespace: bool,
}

impl SpawnedInstanceInfo {
    pub fn parse(args: &[String]) -> Option<Self> {
        let [pid, addr, is_abstract] = args else {
            return None;
        };
        Some(SpawnedInstanceInfo {
            pid: pid.parse().ok()?,
            listener_address: addr.clone(),
            using_abstract_namespace: parse_bool_str(is_abstract),
        })
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.pid.to_string(),
            self.listener_address.clone(),
            if self.using_abstract_namespace {
                "true"
            } else {
                "false"
            }
                .to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apppool_core::AppRoot;

    #[test]
    fn spawn_args_round_trip_through_parse() {
        let root = AppRoot::normalize(std::env::temp_dir()).unwrap();
        let opts = SpawnOptions::new(root, "production");
        let args = spawn_application_args(&opts);
        assert_eq!(args[0], "spawn_application");
        assert_eq!(args[2], "true");
    }

    #[test]
    fn spawned_instance_info_round_trips() {
        let info = SpawnedInstanceInfo {
            pid: 4242,
            listener_address: "/tmp/socket".to_string(),
            using_abstract_namespace: false,
        };
        let args = info.to_args();
        let parsed = SpawnedInstanceInfo::parse(&args).unwrap();
        assert_eq!(parsed, info);
    }
}
