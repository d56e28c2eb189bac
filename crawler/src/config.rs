#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool sizing for each crawl run.
    pub pool: scour_exec::pool::Config,

    /// How long [`Crawler::stop`](crate::Crawler::stop) waits for workers to
    /// exit before warning. Cancellation stays cooperative either way.
    #[cfg_attr(feature = "serde", serde(default = "default_stop_grace_period"))]
    pub stop_grace_period: std::time::Duration,
}

fn default_stop_grace_period() -> std::time::Duration {
    std::time::Duration::from_secs(5)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: scour_exec::pool::Config::default(),
            stop_grace_period: default_stop_grace_period(),
        }
    }
}
