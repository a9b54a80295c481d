//! Shared test harness: Redis in a container via testcontainers.
//!
//! No manual Redis setup required; each test starts its own instance and
//! isolates its keys under a unique prefix.

use std::time::Duration;

use rrb::BrokerOptions;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// A Redis instance scoped to one test. Stops when dropped.
pub struct TestRedis {
    _container: ContainerAsync<GenericImage>,
    url: String,
}

impl TestRedis {
    /// Start a fresh Redis container and route participant logs to the
    /// test output.
    pub async fn start() -> Self {
        init_tracing();

        let container = GenericImage::new("redis", "7")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .with_startup_timeout(Duration::from_secs(60))
            .start()
            .await
            .expect("Failed to start redis container");

        let host = container
            .get_host()
            .await
            .expect("Failed to get container host");
        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get mapped port");

        Self {
            _container: container,
            url: format!("redis://{host}:{port}"),
        }
    }

    /// Options pointing at this instance, isolated under a unique prefix.
    pub fn options(&self) -> BrokerOptions {
        let prefix = format!(
            "test_{}:",
            &uuid::Uuid::new_v4().to_string().replace('-', "")[..8]
        );
        BrokerOptions::default()
            .with_url(self.url.as_str())
            .with_prefix(prefix)
    }
}

/// Install a fmt subscriber once per test binary; later calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
