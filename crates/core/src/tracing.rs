use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use crate::config::GlobalExecutor;
use crate::ring::{ConnectionEvent, ConnectionTable};

/// Logs every connect and disconnect of `table` under `label` until the table
/// is dropped.
pub fn spawn_connection_log(label: String, table: &ConnectionTable) -> JoinHandle<()> {
    let events = table.subscribe();
    GlobalExecutor::spawn(log_connection_events(label, events))
}

async fn log_connection_events(label: String, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Connected(args)) => tracing::info!(
                node = %label,
                address = %args.address,
                con_type = %args.con_type,
                index = args.index,
                edge = %args.edge.to_uri(),
                "Connected"
            ),
            Ok(ConnectionEvent::Disconnected(args)) => tracing::info!(
                node = %label,
                address = %args.address,
                con_type = %args.con_type,
                index = args.index,
                "Disconnected"
            ),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(node = %label, missed, "Connection log fell behind")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    /// Installs the global subscriber.
    ///
    /// `RUST_LOG` directives win over `level`. `RINGLINK_LOG_FORMAT=json`
    /// switches to JSON lines, `RINGLINK_DISABLE_LOGS` installs nothing.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var("RINGLINK_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy();

        let use_json = std::env::var("RINGLINK_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));
        let fmt_layer = if use_json {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed()
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
