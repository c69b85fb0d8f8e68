//! Routing controller: fan-in from data clients, merge, recompile,
//! atomic publish.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use arc_swap::ArcSwap;
use local_sync::mpsc;

use crate::cancel::Waiter;
use crate::compiler::{default_postprocessors, Postprocessor};
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::endpoint::EndpointRegistry;
use crate::matcher::RoutingTable;
use crate::model::{Backend, RouteDefinition};
use crate::registry::{FilterRegistry, PredicateRegistry};
use crate::AnyError;

/// Pluggable route source. `load_update` may block until a change is
/// observed; implementations are free to return full snapshots
/// periodically instead of true incremental diffs.
pub trait DataClient {
    async fn load_all(&self) -> (Vec<RouteDefinition>, Option<AnyError>);
    async fn load_update(&self) -> (Vec<RouteDefinition>, Vec<String>, Option<AnyError>);
}

/// A data client over a fixed in-memory route set. `load_update` never
/// resolves: a static client never produces further changes.
pub struct StaticClient {
    routes: Vec<RouteDefinition>,
}

impl StaticClient {
    pub fn new(routes: Vec<RouteDefinition>) -> Self {
        Self { routes }
    }
}

impl DataClient for StaticClient {
    async fn load_all(&self) -> (Vec<RouteDefinition>, Option<AnyError>) {
        (self.routes.clone(), None)
    }

    async fn load_update(&self) -> (Vec<RouteDefinition>, Vec<String>, Option<AnyError>) {
        std::future::pending().await
    }
}

/// A handle for pushing new route-script text into a running
/// [`StringClient`] (e.g. from a file watcher in the binary crate, or a
/// test).
#[derive(Clone)]
pub struct StringClientHandle {
    tx: mpsc::unbounded::Tx<String>,
}

impl StringClientHandle {
    pub fn push(&self, script: impl Into<String>) {
        let _ = self.tx.send(script.into());
    }
}

/// A data client over route-script text; re-parses and re-canonicalizes
/// on every [`StringClientHandle::push`].
pub struct StringClient {
    current: RefCell<String>,
    rx: RefCell<mpsc::unbounded::Rx<String>>,
}

impl StringClient {
    pub fn new(initial_script: impl Into<String>) -> (Self, StringClientHandle) {
        let (tx, rx) = mpsc::unbounded::channel();
        (Self { current: RefCell::new(initial_script.into()), rx: RefCell::new(rx) }, StringClientHandle { tx })
    }

    fn parse(&self, src: &str) -> Result<Vec<RouteDefinition>, AnyError> {
        let nodes = crate::script::parse_routes(src)?;
        let mut counter = 0;
        nodes.iter().map(|n| crate::model::canonicalize(n, &mut counter).map_err(AnyError::from)).collect()
    }
}

impl DataClient for StringClient {
    async fn load_all(&self) -> (Vec<RouteDefinition>, Option<AnyError>) {
        let src = self.current.borrow().clone();
        match self.parse(&src) {
            Ok(defs) => (defs, None),
            Err(e) => (Vec::new(), Some(e)),
        }
    }

    async fn load_update(&self) -> (Vec<RouteDefinition>, Vec<String>, Option<AnyError>) {
        let Some(new_src) = self.rx.borrow_mut().recv().await else {
            return std::future::pending().await;
        };
        *self.current.borrow_mut() = new_src.clone();
        match self.parse(&new_src) {
            Ok(defs) => (defs, Vec::new(), None),
            Err(e) => (Vec::new(), Vec::new(), Some(e)),
        }
    }
}

/// Whether the live table reflects at least one successful compile. A
/// bootstrap that times out before any client delivers publishes an
/// empty, not-ready table so serving can start degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    Ready,
}

/// Shared handle to the live routing table, sampled once per request.
/// Cheap to clone; every clone observes the same underlying [`ArcSwap`].
///
/// Built on `arc_swap::ArcSwap` rather than a `RefCell` so a publish can
/// land between any two `await` points of an in-flight request without
/// a borrow-checker panic; the thread-per-core model means the swap is
/// never actually contended across OS threads, but within one thread's
/// task set a loopback re-entry and a controller recompile can still
/// interleave at any suspension point.
#[derive(Clone)]
pub struct RoutingTableHandle {
    inner: Rc<ArcSwap<RoutingTable>>,
    readiness: Rc<RefCell<Readiness>>,
}

impl RoutingTableHandle {
    fn new(initial: RoutingTable) -> Self {
        Self {
            inner: Rc::new(ArcSwap::from_pointee(initial)),
            readiness: Rc::new(RefCell::new(Readiness::NotReady)),
        }
    }

    pub fn load(&self) -> std::sync::Arc<RoutingTable> {
        self.inner.load_full()
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    fn publish(&self, table: RoutingTable, ready: Readiness) {
        self.inner.store(std::sync::Arc::new(table));
        *self.readiness.borrow_mut() = ready;
    }
}

/// Merge each client's latest snapshot keyed by route id; the
/// later-processed client wins on collision.
fn merge(snapshots: &[Vec<RouteDefinition>]) -> Vec<RouteDefinition> {
    let mut merged: BTreeMap<String, RouteDefinition> = BTreeMap::new();
    for snapshot in snapshots {
        for def in snapshot {
            merged.insert(def.id.clone(), def.clone());
        }
    }
    merged.into_values().collect()
}

/// Every backend endpoint a route list references, in registry-key form.
fn referenced_endpoints(defs: &[RouteDefinition]) -> HashSet<String> {
    let mut keys = HashSet::new();
    for def in defs {
        match &def.backend {
            Backend::Network(url) => {
                keys.insert(crate::endpoint::endpoint_key(url));
            }
            Backend::LoadBalanced { endpoints, .. } => {
                keys.extend(endpoints.iter().map(|url| crate::endpoint::endpoint_key(url)));
            }
            _ => {}
        }
    }
    keys
}

pub struct ControllerConfig {
    pub initial_timeout: Duration,
    pub debounce_interval: Duration,
    /// How long a disappeared endpoint keeps its registry entry (and so
    /// its fade-in history) before it is swept.
    pub endpoint_ttl: Duration,
    pub postprocessors: Vec<Postprocessor>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(5),
            debounce_interval: Duration::from_millis(100),
            endpoint_ttl: Duration::from_secs(300),
            postprocessors: default_postprocessors(),
        }
    }
}

/// Drives the data-plane pipeline for a fixed set of clients: initial
/// bootstrap, steady-state debounced recompilation, and atomic publish.
pub struct Controller<C> {
    clients: Vec<C>,
    config: ControllerConfig,
    predicates: PredicateRegistry,
    filters: FilterRegistry,
    endpoints: EndpointRegistry,
    diagnostics: DiagnosticSink,
    table: RoutingTableHandle,
    generation: RefCell<u64>,
    snapshots: RefCell<Vec<Vec<RouteDefinition>>>,
}

impl<C: DataClient> Controller<C> {
    pub fn new(
        clients: Vec<C>,
        config: ControllerConfig,
        predicates: PredicateRegistry,
        filters: FilterRegistry,
        endpoints: EndpointRegistry,
        diagnostics: DiagnosticSink,
    ) -> Self {
        let n = clients.len();
        Self {
            clients,
            config,
            predicates,
            filters,
            endpoints,
            diagnostics,
            table: RoutingTableHandle::new(RoutingTable::builder(0).finish(false)),
            generation: RefCell::new(0),
            snapshots: RefCell::new(vec![Vec::new(); n]),
        }
    }

    pub fn table_handle(&self) -> RoutingTableHandle {
        self.table.clone()
    }

    /// Run every client's `load_all` concurrently; recompile and publish
    /// once at least one succeeds, or mark the table not-ready after
    /// `initial_timeout`.
    pub async fn bootstrap(&self) {
        let loads = self.clients.iter().enumerate().map(|(idx, client)| async move {
            let (defs, err) = client.load_all().await;
            (idx, defs, err)
        });
        let all = futures::future::join_all(loads);
        let timeout = monoio::time::sleep(self.config.initial_timeout);
        monoio::select! {
            results = all => {
                let mut any_ok = false;
                for (idx, defs, err) in results {
                    if let Some(e) = err {
                        self.diagnostics.emit(client_diagnostic(&e));
                    } else {
                        any_ok = true;
                    }
                    self.snapshots.borrow_mut()[idx] = defs;
                }
                if any_ok {
                    self.recompile();
                } else {
                    self.table.publish(RoutingTable::builder(0).finish(false), Readiness::NotReady);
                }
            }
            _ = timeout => {
                self.table.publish(RoutingTable::builder(0).finish(false), Readiness::NotReady);
            }
        }
    }

    /// Steady-state polling loop. Each client's `load_update` is raced
    /// concurrently; whichever resolves first updates that client's
    /// snapshot and schedules a debounced recompile.
    pub async fn run(&self, shutdown: Waiter) {
        if self.clients.is_empty() {
            shutdown.await;
            self.diagnostics.emit(Diagnostic::shutdown());
            return;
        }

        loop {
            if shutdown.cancelled() {
                self.diagnostics.emit(Diagnostic::shutdown());
                return;
            }

            let updates = self.clients.iter().enumerate().map(|(idx, client)| async move {
                let (defs, deleted, err) = client.load_update().await;
                (idx, defs, deleted, err)
            });
            let any_update = futures::future::select_all(updates.map(Box::pin));

            monoio::select! {
                (update, _winner, _rest) = any_update => {
                    let (idx, defs, deleted, err) = update;
                    if let Some(e) = err {
                        self.diagnostics.emit(client_diagnostic(&e));
                    }
                    let mut snapshots = self.snapshots.borrow_mut();
                    if !deleted.is_empty() {
                        snapshots[idx].retain(|d| !deleted.contains(&d.id));
                    }
                    for def in defs {
                        if let Some(existing) = snapshots[idx].iter_mut().find(|d| d.id == def.id) {
                            *existing = def;
                        } else {
                            snapshots[idx].push(def);
                        }
                    }
                    drop(snapshots);
                    monoio::time::sleep(self.config.debounce_interval).await;
                    self.recompile();
                }
                _ = shutdown.clone() => {
                    self.diagnostics.emit(Diagnostic::shutdown());
                    return;
                }
            }
        }
    }

    fn recompile(&self) {
        let merged = merge(&self.snapshots.borrow());
        let mut generation = self.generation.borrow_mut();
        *generation += 1;
        let result = crate::compiler::compile(
            merged.clone(),
            &self.predicates,
            &self.filters,
            &self.endpoints,
            &self.config.postprocessors,
            *generation,
        );
        for diagnostic in result.diagnostics {
            self.diagnostics.emit(diagnostic);
        }
        self.table.publish(result.table, Readiness::Ready);

        // Endpoints no longer referenced by any route keep their fade-in
        // history for a grace period, in case they come straight back.
        let live = referenced_endpoints(&merged);
        for key in self.endpoints.keys() {
            if !live.contains(&key) {
                self.endpoints.mark_removed(&key);
            }
        }
        self.endpoints.sweep_expired(self.config.endpoint_ttl);
    }
}

/// Classify a client-reported failure: parse failures from script-backed
/// clients keep their own diagnostic kind, anything else is a generic
/// client error.
fn client_diagnostic(e: &AnyError) -> Diagnostic {
    match e.downcast_ref::<crate::script::ParseError>() {
        Some(parse) => Diagnostic::parse_error(parse.to_string()),
        None => Diagnostic::client_error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Canceller;
    use crate::diagnostics::DiagnosticKind;
    use crate::registry::{default_filter_registry, default_predicate_registry};

    fn route(id: &str, script: &str) -> RouteDefinition {
        let nodes = crate::script::parse_routes(script).unwrap();
        let mut counter = 0;
        let mut def = crate::model::canonicalize(&nodes[0], &mut counter).unwrap();
        def.id = id.to_string();
        def
    }

    fn controller_over(clients: Vec<StaticClient>, config: ControllerConfig) -> (Controller<StaticClient>, crate::diagnostics::DiagnosticStream) {
        let (sink, stream) = crate::diagnostics::channel();
        let controller = Controller::new(
            clients,
            config,
            default_predicate_registry(),
            default_filter_registry(),
            EndpointRegistry::new(),
            sink,
        );
        (controller, stream)
    }

    #[monoio::test(timer_enabled = true)]
    async fn bootstrap_with_static_client_publishes_ready_table() {
        let defs = vec![route("r1", r#"r1: Path("/a") -> status(200) -> <shunt>;"#)];
        let (controller, _stream) = controller_over(vec![StaticClient::new(defs)], ControllerConfig::default());
        controller.bootstrap().await;
        let table = controller.table_handle();
        assert_eq!(table.readiness(), Readiness::Ready);
        assert_eq!(table.load().len(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn bootstrap_with_no_clients_is_not_ready() {
        let (controller, _stream) = controller_over(
            Vec::new(),
            ControllerConfig { initial_timeout: Duration::from_millis(10), ..Default::default() },
        );
        controller.bootstrap().await;
        assert_eq!(controller.table_handle().readiness(), Readiness::NotReady);
    }

    #[monoio::test(timer_enabled = true)]
    async fn string_client_push_recompiles_table() {
        let (client, handle) = StringClient::new(r#"r1: Path("/a") -> status(200) -> <shunt>;"#);
        let (sink, _stream) = crate::diagnostics::channel();
        let controller = Controller::new(
            vec![client],
            ControllerConfig::default(),
            default_predicate_registry(),
            default_filter_registry(),
            EndpointRegistry::new(),
            sink,
        );
        controller.bootstrap().await;
        assert_eq!(controller.table_handle().load().len(), 1);

        handle.push(r#"r1: Path("/a") -> status(200) -> <shunt>; r2: Path("/b") -> status(200) -> <shunt>;"#);
        let canceller = Canceller::new();
        let waiter = canceller.waiter();
        monoio::select! {
            _ = controller.run(waiter) => {}
            _ = monoio::time::sleep(Duration::from_millis(200)) => {}
        }
        assert_eq!(controller.table_handle().load().len(), 2);
    }

    #[monoio::test(timer_enabled = true)]
    async fn unparseable_script_surfaces_a_parse_error_diagnostic() {
        let (client, _handle) = StringClient::new("this is not a route script");
        let (sink, mut stream) = crate::diagnostics::channel();
        let controller = Controller::new(
            vec![client],
            ControllerConfig::default(),
            default_predicate_registry(),
            default_filter_registry(),
            EndpointRegistry::new(),
            sink,
        );
        controller.bootstrap().await;
        let diag = stream.recv().await.unwrap();
        assert_eq!(diag.kind, DiagnosticKind::ParseError);
    }

    #[test]
    fn merge_is_later_client_wins_by_id() {
        let a = vec![route("r1", r#"r1: Path("/a") -> status(200) -> <shunt>;"#)];
        let mut b_def = route("r1", r#"r1: Path("/b") -> status(200) -> <shunt>;"#);
        b_def.id = "r1".to_string();
        let merged = merge(&[a, vec![b_def]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "r1");
    }
}
