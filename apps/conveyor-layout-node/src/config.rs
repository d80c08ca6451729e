use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use conveyor_node::{NodeTimings, StallReroutePolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct LayoutNodeConfig {
    pub layout_path: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub load_retry: Duration,
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub watchdog_period: Duration,
    pub watchdog_enabled: bool,
    pub load_max_retries: Option<u32>,
    pub max_tracked_queries: usize,
    pub stall_reroute: StallReroutePolicy,
    #[serde(deserialize_with = "deserialize_list")]
    pub down: Vec<String>,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl LayoutNodeConfig {
    /// Layers defaults, an optional config file, then `CONVEYOR_*` variables.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("layout_path", None::<String>)?
            .set_default("load_retry", "4s")?
            .set_default("reply_timeout", "10s")?
            .set_default("busy_timeout", "8s")?
            .set_default("watchdog_period", "1s")?
            .set_default("watchdog_enabled", true)?
            .set_default("load_max_retries", None::<u32>)?
            .set_default("max_tracked_queries", 4_096)?
            .set_default("stall_reroute", "self_request")?
            .set_default("down", Vec::<String>::new())?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("CONVEYOR").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn timings(&self) -> NodeTimings {
        NodeTimings::builder()
            .load_retry_ms(millis(self.load_retry))
            .reply_timeout_ms(millis(self.reply_timeout))
            .busy_timeout_ms(millis(self.busy_timeout))
            .watchdog_period_ms(millis(self.watchdog_period))
            .watchdog_enabled(self.watchdog_enabled)
            .load_max_retries(self.load_max_retries)
            .max_tracked_queries(self.max_tracked_queries)
            .stall_reroute(self.stall_reroute)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_match_node_timings() {
        with_env(&[], || {
            let cfg = LayoutNodeConfig::new(None).expect("failed to build config");
            assert_eq!(cfg.layout_path, None);
            assert_eq!(cfg.busy_timeout, Duration::from_secs(8));
            assert!(cfg.down.is_empty());
            assert_eq!(cfg.timings(), NodeTimings::default());
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("CONVEYOR_LOAD_RETRY", "1500ms"),
                ("CONVEYOR_LOAD_MAX_RETRIES", "3"),
                ("CONVEYOR_STALL_REROUTE", "release_and_reload"),
                ("CONVEYOR_DOWN", "CNV4, CNV9"),
            ],
            || {
                let cfg = LayoutNodeConfig::new(None).expect("failed to build config");
                let timings = cfg.timings();
                assert_eq!(timings.load_retry_ms, 1_500);
                assert_eq!(timings.load_max_retries, Some(3));
                assert_eq!(timings.stall_reroute, StallReroutePolicy::ReleaseAndReload);
                assert_eq!(cfg.down, vec!["CNV4".to_string(), "CNV9".to_string()]);
            },
        );
    }

    #[test]
    fn file_values_are_layered_under_env() {
        use std::io::Write;

        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file should be created");
        writeln!(
            file,
            "layout_path = \"plant.toml\"\nbusy_timeout = \"30s\"\nwatchdog_enabled = false\nreply_timeout = \"2s\""
        )
        .expect("config should be written");

        with_env(&[("CONVEYOR_REPLY_TIMEOUT", "5s")], || {
            let cfg = LayoutNodeConfig::new(Some(file.path().to_path_buf()))
                .expect("failed to build config");
            assert_eq!(cfg.layout_path, Some(PathBuf::from("plant.toml")));
            assert_eq!(cfg.busy_timeout, Duration::from_secs(30));
            assert!(!cfg.watchdog_enabled);
            assert_eq!(cfg.reply_timeout, Duration::from_secs(5));
        });
    }
}
