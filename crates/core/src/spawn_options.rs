//! SpawnOptions: everything needed to spawn or look up an instance.

use std::path::PathBuf;

use crate::app_root::AppRoot;

/// Application type tag. Interpreted by the spawn server only; the pool
/// treats it as an opaque string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Rails,
    Rack,
    Wsgi,
}

impl AppType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            AppType::Rails => "rails",
            AppType::Rack => "rack",
            AppType::Wsgi => "wsgi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMethod {
    Smart,
    SmartLv2,
    Conservative,
}

impl SpawnMethod {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            SpawnMethod::Smart => "smart",
            SpawnMethod::SmartLv2 => "smart-lv2",
            SpawnMethod::Conservative => "conservative",
        }
    }
}

/// "Unspecified" (the -1 sentinel in the wire protocol) is modeled here as
/// `Option<u64>` rather than a magic number.
pub type SpawnerTimeout = Option<u64>;

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub app_root: AppRoot,
    pub app_type: AppType,
    pub environment: String,
    pub spawn_method: SpawnMethod,
    pub lower_privilege: bool,
    pub lowest_user: String,
    pub framework_spawner_timeout: SpawnerTimeout,
    pub app_spawner_timeout: SpawnerTimeout,
    /// 0 = unlimited.
    pub max_requests: u64,
    /// 0 = unlimited, in MB.
    pub memory_limit: u64,
    pub use_global_queue: bool,
    pub stat_throttle_rate: u64,
    pub restart_dir: Option<PathBuf>,
    /// Lazily produced so callers that never actually spawn never pay for
    /// building the environment block.
    pub environment_variables: Option<Vec<(String, String)>>,
}

impl SpawnOptions {
    pub fn new(app_root: AppRoot, environment: impl Into<String>) -> Self {
        SpawnOptions {
            app_root,
            app_type: AppType::Rack,
            environment: environment.into(),
            spawn_method: SpawnMethod::Smart,
            lower_privilege: true,
            lowest_user: "nobody".to_string(),
            framework_spawner_timeout: None,
            app_spawner_timeout: None,
            max_requests: 0,
            memory_limit: 0,
            use_global_queue: false,
            stat_throttle_rate: 1,
            restart_dir: None,
            environment_variables: None,
        }
    }

    /// Directory searched for `restart.txt` / `tmp/always_restart.txt`.
    pub fn restart_dir(&self) -> PathBuf {
        match &self.restart_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.app_root.as_path().join(dir),
            None => self.app_root.as_path().to_path_buf(),
        }
    }

    /// The environment variable block, computed on first access.
    pub fn environment_variables(&mut self) -> &[(String, String)] {
        if self.environment_variables.is_none() {
            self.environment_variables = Some(vec![
                ("RAILS_ENV".to_string(), self.environment.clone()),
                ("RACK_ENV".to_string(), self.environment.clone()),
            ]);
        }
        self.environment_variables.as_deref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> AppRoot {
        AppRoot::normalize(std::env::temp_dir()).unwrap()
    }

    #[test]
    fn restart_dir_defaults_to_app_root() {
        let opts = SpawnOptions::new(fake_root(), "production");
        assert_eq!(opts.restart_dir(), opts.app_root.as_path());
    }

    #[test]
    fn restart_dir_relative_is_joined() {
        let mut opts = SpawnOptions::new(fake_root(), "production");
        opts.restart_dir = Some(PathBuf::from("config"));
        assert_eq!(opts.restart_dir(), opts.app_root.as_path().join("config"));
    }

    #[test]
    fn environment_variables_are_lazy() {
        let mut opts = SpawnOptions::new(fake_root(), "production");
        assert!(opts.environment_variables.is_none());
        let vars = opts.environment_variables();
        assert!(!vars.is_empty());
    }
}
