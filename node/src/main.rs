use axum::{routing::get, serve, Extension, Router};
use clap::{Arg, Command};
use commonware_runtime::{tokio, Clock, Metrics, Runner, Spawner};
use futures::future::try_join_all;
use rand::{Rng, RngCore};
use sluice_node::Config;
use sluice_queue::{
    driver::{memory::Memory, retry::Retrying},
    repair, Engine,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, error, info, Level};

fn main() {
    // Parse arguments
    let matches = Command::new("sluice-node")
        .about("repair (and optionally exercise) sluice queues")
        .arg(Arg::new("config").long("config").required(true))
        .get_matches();

    // Load config
    let config_file = matches.get_one::<String>("config").unwrap();
    let config_file = std::fs::read_to_string(config_file).expect("Could not read config file");
    let config: Config = serde_yaml::from_str(&config_file).expect("Could not parse config file");
    let engine_cfg = config.engine().expect("Invalid engine config");
    let queues = config.definitions().expect("Invalid queue definition");
    if let Some(workload) = &config.workload {
        workload.validate().expect("Invalid workload");
    }

    // Create logger
    let level = Level::from_str(&config.log_level).expect("Invalid log level");
    let logger = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_line_number(true)
        .with_file(true);
    if config.log_json {
        logger.json().init();
    } else {
        logger.init();
    }
    info!(
        queues = queues.len(),
        metrics_port = config.metrics_port,
        workload = config.workload.is_some(),
        "loaded config"
    );

    // Start runtime
    let executor = tokio::Runner::default();
    executor.start(|context| async move {
        // Initialize storage
        let memory = Memory::new(context.with_label("storage"), config.storage.memory());
        let driver = Retrying::new(context.with_label("storage"), memory, config.storage.retry());
        let engine = Engine::new(context.with_label("engine"), driver.clone(), engine_cfg);

        // Start repair
        let (manager, mut mailbox) =
            repair::Manager::new(context.with_label("repair"), driver, config.repair.config());
        let mut tasks = vec![manager.start()];
        for queue in &queues {
            if !mailbox.start(queue.clone()).await {
                error!(queue = queue.id(), "duplicate queue");
            }
        }

        // Start workload
        if let Some(workload) = config.workload {
            for queue in queues {
                let producer = {
                    let engine = engine.clone();
                    let queue = queue.clone();
                    let workload = workload.clone();
                    context
                        .with_label("producer")
                        .spawn(move |mut context| async move {
                            let interval = Duration::from_millis(workload.publish_interval_ms);
                            loop {
                                let mut blob = vec![0; workload.message_size];
                                context.fill_bytes(&mut blob);
                                match engine.put(&queue, blob.into(), Duration::ZERO).await {
                                    Ok(index) => debug!(queue = queue.id(), index, "published"),
                                    Err(err) => error!(queue = queue.id(), ?err, "publish failed"),
                                }
                                context.sleep(interval).await;
                            }
                        })
                };
                let consumer = {
                    let engine = engine.clone();
                    let workload = workload.clone();
                    context
                        .with_label("consumer")
                        .spawn(move |mut context| async move {
                            let interval = Duration::from_millis(workload.consume_interval_ms);
                            let invisibility = Duration::from_millis(workload.invisibility_ms);
                            loop {
                                match engine.next_message(&queue, invisibility).await {
                                    Ok(Some(delivery)) => {
                                        if !context.gen_bool(workload.ack_probability) {
                                            debug!(
                                                queue = queue.id(),
                                                index = delivery.index,
                                                "dropped delivery"
                                            );
                                        } else if let Err(err) =
                                            engine.ack(&queue, &delivery.receipt).await
                                        {
                                            error!(queue = queue.id(), ?err, "ack failed");
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(err) => error!(queue = queue.id(), ?err, "consume failed"),
                                }
                                context.sleep(interval).await;
                            }
                        })
                };
                tasks.push(producer);
                tasks.push(consumer);
            }
        }

        // Serve metrics
        let metrics_port = config.metrics_port;
        let metrics = context.with_label("metrics").spawn(move |context| async move {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), metrics_port);
            let listener = ::tokio::net::TcpListener::bind(addr)
                .await
                .expect("Could not bind to metrics address");
            let app = Router::new()
                .route(
                    "/metrics",
                    get(|extension: Extension<tokio::Context>| async move { extension.0.encode() }),
                )
                .layer(Extension(context));
            serve(listener, app.into_make_service())
                .await
                .expect("Could not serve metrics");
        });
        tasks.push(metrics);

        // Wait for any task to error
        if let Err(e) = try_join_all(tasks).await {
            error!(?e, "task failed");
        }
        drop(mailbox);
    });
}
