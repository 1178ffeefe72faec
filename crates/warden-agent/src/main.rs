use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use warden_agent::config::{AgentConfig, ServerConfig};
use warden_agent::coordinator::ReadyHook;
use warden_agent::process_probe::SystemProbe;
use warden_agent::settings::{FileSettings, SettingsStore};
use warden_agent::supervisor::StatusSink;
use warden_agent::{
    MessageRelay, MonitorSpec, MultiServerCoordinator, ProcessSupervisor, SupervisorParts,
    WindowLocator, settings, user_message,
};
use warden_process::{ServerId, StatusKind, SupervisorEvent};

const RENDER_TICK: Duration = Duration::from_millis(200);
const CONSOLE_SYNC_TICK: Duration = Duration::from_secs(2);

fn autostart_enabled() -> bool {
    std::env::var("WARDEN_AUTOSTART")
        .ok()
        .and_then(|v| settings::parse_bool(&v))
        .unwrap_or(false)
}

fn print_event(server_id: &ServerId, event: &SupervisorEvent) {
    match event.kind() {
        StatusKind::Error => tracing::error!(server_id = %server_id, "{}", event.message()),
        StatusKind::Warning => tracing::warn!(server_id = %server_id, "{}", event.message()),
        _ => tracing::info!(server_id = %server_id, "{}", event.message()),
    }
    println!("[{server_id}] {}: {}", event.kind().as_str(), event.message());
}

fn build_supervisors(
    cfg: &AgentConfig,
    store: &Arc<FileSettings>,
) -> BTreeMap<ServerId, ProcessSupervisor> {
    let probe = Arc::new(SystemProbe);
    let sink: Arc<dyn StatusSink> =
        Arc::new(|id: &ServerId, event: SupervisorEvent| print_event(id, &event));

    store
        .children("server")
        .into_iter()
        .map(|id| {
            let server = ServerConfig::from_settings(store.as_ref(), &id);
            tracing::debug!(
                server_id = %id,
                executable = %server.executable.display(),
                log_dir = %server.log_dir.display(),
                "server configured"
            );
            let sup = ProcessSupervisor::new(
                server,
                SupervisorParts {
                    probe: probe.clone(),
                    windows: WindowLocator::platform(&cfg.window_keywords),
                    settings: store.clone(),
                    sink: sink.clone(),
                    timings: cfg.timings.clone(),
                    state_dir: cfg.state_dir.clone(),
                },
            );
            (sup.id().clone(), sup)
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env();
    let _log_guard = warden_agent::logging::init(&cfg.logging)?;

    let store = Arc::new(
        FileSettings::load(&cfg.settings_path)
            .with_context(|| format!("load settings from {}", cfg.settings_path.display()))?,
    );
    let supervisors = Arc::new(build_supervisors(&cfg, &store));
    if supervisors.is_empty() {
        tracing::warn!(path = %cfg.settings_path.display(), "no [server.<id>] entries configured");
    }
    tracing::info!(
        servers = supervisors.len(),
        version = env!("CARGO_PKG_VERSION"),
        "warden-agent starting"
    );

    let (relay, consumer) = MessageRelay::bounded(cfg.relay_capacity);
    let on_ready: ReadyHook = {
        let supervisors = supervisors.clone();
        Arc::new(move |id: &ServerId| {
            if let Some(sup) = supervisors.get(id) {
                sup.mark_active();
            }
        })
    };
    let coordinator = MultiServerCoordinator::new(relay, cfg.tail.clone(), on_ready);

    let autostart = autostart_enabled();
    for (id, sup) in supervisors.iter() {
        let already_running = sup.is_running();
        let spec = MonitorSpec::for_server(sup.config(), already_running, &cfg.tail);
        coordinator
            .start_monitoring(spec)
            .with_context(|| format!("start monitoring {id}"))?;
        coordinator.set_displayed(id, true);

        if autostart && !already_running {
            match sup.start(sup.default_launch_spec()) {
                Ok(handle) => tracing::info!(server_id = %id, pid = handle.pid(), "autostarted"),
                Err(e) => {
                    user_message::report("autostart", &e);
                }
            }
        }
    }

    let mut render = tokio::time::interval(RENDER_TICK);
    let mut console_sync = tokio::time::interval(CONSOLE_SYNC_TICK);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = render.tick() => {
                let mut out = std::io::stdout().lock();
                let mut sink = |id: &ServerId, text: &str| {
                    if coordinator.is_displayed(id) {
                        let _ = writeln!(out, "[{id}] {text}");
                    }
                };
                if consumer.drain(&mut sink) > 0 {
                    let _ = out.flush();
                }
            }
            _ = console_sync.tick() => {
                // Window confirmation sleeps between re-queries.
                let supervisors = supervisors.clone();
                let synced = tokio::task::spawn_blocking(move || {
                    for sup in supervisors.values() {
                        if sup.state().is_live() {
                            sup.apply_console_preference();
                        }
                    }
                })
                .await;
                if let Err(e) = synced {
                    tracing::warn!(error = %e, "console sync task failed");
                }
            }
            res = &mut shutdown => {
                res.context("listen for ctrl-c")?;
                break;
            }
        }
    }

    tracing::info!("shutting down monitors; servers keep running");
    let report = coordinator.teardown(cfg.join_timeout);
    if !report.leaked.is_empty() {
        tracing::warn!(leaked = ?report.leaked, "some monitor loops were detached");
    }
    if consumer.dropped() > 0 {
        tracing::warn!(dropped = consumer.dropped(), "log lines dropped by the relay");
    }
    Ok(())
}
