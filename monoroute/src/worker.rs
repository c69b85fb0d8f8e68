//! Per-thread wiring: one routing controller and one execution engine
//! per worker, sharing nothing across the thread-per-core boundary.

use std::net::IpAddr;
use std::rc::Rc;

use monoio::io::{AsyncReadRent, AsyncWriteRent};
use monoroute_core::listener::{Conn, ListenerBuilder};
use monoroute_route::cancel::Canceller;
use monoroute_route::controller::{Controller, ControllerConfig, StringClient};
use monoroute_route::diagnostics;
use monoroute_route::endpoint::EndpointRegistry;
use monoroute_route::engine::{Engine, EngineConfig};
use monoroute_route::registry::{default_filter_registry, default_predicate_registry};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatch::NetworkDispatcher;

pub async fn run_worker(config: Config, route_script: String) -> anyhow::Result<()> {
    let (client, _handle) = StringClient::new(route_script);

    let (diag_sink, diag_stream) = diagnostics::channel();
    monoio::spawn(diagnostics::log_forever(diag_stream));

    let endpoints = EndpointRegistry::new();

    let controller = Rc::new(Controller::new(
        vec![client],
        ControllerConfig::default(),
        default_predicate_registry(),
        default_filter_registry(),
        endpoints.clone(),
        diag_sink.clone(),
    ));
    controller.bootstrap().await;

    let canceller = Canceller::new();
    let shutdown = canceller.waiter();
    let controller_loop = controller.clone();
    let shutdown_for_loop = shutdown.clone();
    monoio::spawn(async move { controller_loop.run(shutdown_for_loop).await });

    let table = controller.table_handle();
    let engine = Rc::new(
        Engine::new(EngineConfig::default(), endpoints, NetworkDispatcher).with_diagnostics(diag_sink),
    );

    // Every worker binds its own accepting socket; the default listener
    // options include SO_REUSEPORT, so the kernel spreads connections
    // across the per-worker sockets.
    let listener = ListenerBuilder::bind_tcp(config.listen, Default::default()).build()?;
    info!("monoroute listening on {}", config.listen);

    loop {
        match listener.accept().await {
            Ok((Conn::Tcp(stream), peer_ip)) => {
                spawn_connection(stream, peer_ip, engine.clone(), table.clone(), shutdown.clone());
            }
            #[cfg(unix)]
            Ok((Conn::Unix(stream), peer_ip)) => {
                spawn_connection(stream, peer_ip, engine.clone(), table.clone(), shutdown.clone());
            }
            Err(e) => warn!("accept failed: {e:?}"),
        }
    }
}

fn spawn_connection<S: AsyncReadRent + AsyncWriteRent + 'static>(
    stream: S,
    peer_ip: Option<IpAddr>,
    engine: Rc<Engine<NetworkDispatcher>>,
    table: monoroute_route::controller::RoutingTableHandle,
    cancel: monoroute_route::cancel::Waiter,
) {
    monoio::spawn(serve_connection(stream, peer_ip, engine, table, cancel));
}

async fn serve_connection<S: AsyncReadRent + AsyncWriteRent>(
    mut stream: S,
    peer_ip: Option<IpAddr>,
    engine: Rc<Engine<NetworkDispatcher>>,
    table: monoroute_route::controller::RoutingTableHandle,
    cancel: monoroute_route::cancel::Waiter,
) {
    loop {
        let request = match crate::http1::read_request(&mut stream).await {
            Ok(Some(req)) => req,
            Ok(None) => return,
            Err(e) => {
                error!("malformed request: {e:?}");
                return;
            }
        };

        // Sampled once per request; loopbacks inside `handle` stay on
        // this snapshot even if the controller publishes meanwhile.
        let snapshot = table.load();
        let (response, keep_alive) = engine.handle(&snapshot, request, peer_ip, cancel.clone()).await;

        if let Err(e) = crate::http1::write_response(&mut stream, response).await {
            error!("failed to write response: {e:?}");
            return;
        }

        if !keep_alive {
            return;
        }
    }
}
