mod logging;

use std::{env, process, sync::Arc, time::Duration};

use apilink_client::LinkContext;
use apilink_core::{EventBusError, LinkConfig, LinkEvent, next_event};
use apilink_platform::FileStore;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    let verbose = env::args().skip(1).any(|arg| arg == "-v" || arg == "--verbose");
    let watch = watch_duration();
    logging::init(logging::Profile::select(verbose, watch.is_some()));

    let config = match LinkConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(1);
        }
    };
    let store = Arc::new(FileStore::new(config.storage_dir.clone()));
    let ctx = match LinkContext::new(config, store) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("Failed to initialize link layer: {err}");
            process::exit(1);
        }
    };

    let status = ctx.monitor().probe_now().await;
    let state = ctx.connectivity();
    println!("backend: {}", ctx.config().base_url);
    println!("status: {status:?}");
    if let Some(class) = state.last_error {
        println!("last error: {}", class.code());
    }
    println!("degraded: {}", ctx.gateway().is_degraded());
    println!("authenticated: {}", ctx.session().is_authenticated());

    let Some(watch) = watch else {
        if !status.is_usable() {
            process::exit(2);
        }
        return;
    };

    let mut stream = ctx.subscribe();
    if let Err(err) = ctx.start_monitor().await {
        eprintln!("Failed to start connectivity monitor: {err}");
        process::exit(1);
    }
    info!(seconds = watch.as_secs(), "watching connectivity");

    let handle = ctx.connectivity_handle();
    let deadline = tokio::time::sleep(watch);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            received = next_event(&mut stream) => match received {
                Ok(LinkEvent::Notify { notice }) => println!("notice: {notice:?}"),
                Ok(LinkEvent::ConnectivityChanged { status }) => println!("status: {status:?}"),
                Ok(_) => {}
                Err(EventBusError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(EventBusError::Closed) => break,
            },
        }
    }

    if let Err(err) = ctx.stop_monitor().await {
        warn!("failed to stop monitor: {err}");
    }
    println!("final status: {:?}", handle.status());
}

fn watch_duration() -> Option<Duration> {
    let raw = env::var("APILINK_WATCH_SECS").ok()?;
    match raw.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => {
            eprintln!("Ignoring invalid APILINK_WATCH_SECS={raw}");
            None
        }
    }
}
