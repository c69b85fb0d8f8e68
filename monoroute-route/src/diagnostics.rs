//! Structured diagnostic records for parse/compile/client errors and
//! tie-break/shutdown notices, delivered to programmatic consumers
//! alongside (not instead of) `tracing` output.

use local_sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    ParseError,
    CompileError,
    ClientError,
    TieBreak,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub route_id: Option<String>,
    pub table_generation: Option<u64>,
    pub detail: String,
}

impl Diagnostic {
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self { kind: DiagnosticKind::ParseError, route_id: None, table_generation: None, detail: detail.into() }
    }

    pub fn compile_error(route_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::CompileError,
            route_id: Some(route_id.into()),
            table_generation: None,
            detail: detail.into(),
        }
    }

    pub fn client_error(detail: impl Into<String>) -> Self {
        Self { kind: DiagnosticKind::ClientError, route_id: None, table_generation: None, detail: detail.into() }
    }

    pub fn tie_break(table_generation: u64, route_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::TieBreak,
            route_id: Some(route_id.into()),
            table_generation: Some(table_generation),
            detail: detail.into(),
        }
    }

    pub fn shutdown() -> Self {
        Self { kind: DiagnosticKind::Shutdown, route_id: None, table_generation: None, detail: String::new() }
    }
}

/// An async sink for [`Diagnostic`] records. The controller holds the
/// sender side; the binary crate (or tests) drains the receiver side,
/// typically logging each record via `tracing`.
#[derive(Clone)]
pub struct DiagnosticSink {
    tx: mpsc::unbounded::Tx<Diagnostic>,
}

pub struct DiagnosticStream {
    rx: mpsc::unbounded::Rx<Diagnostic>,
}

pub fn channel() -> (DiagnosticSink, DiagnosticStream) {
    let (tx, rx) = mpsc::unbounded::channel();
    (DiagnosticSink { tx }, DiagnosticStream { rx })
}

impl DiagnosticSink {
    pub fn emit(&self, diagnostic: Diagnostic) {
        let _ = self.tx.send(diagnostic);
    }
}

impl DiagnosticStream {
    pub async fn recv(&mut self) -> Option<Diagnostic> {
        self.rx.recv().await
    }
}

/// Drain a diagnostic stream, logging each record through `tracing` at a
/// level appropriate to its kind. Intended as the default sink consumer
/// for the `monoroute` binary.
pub async fn log_forever(mut stream: DiagnosticStream) {
    while let Some(d) = stream.recv().await {
        match d.kind {
            DiagnosticKind::ParseError | DiagnosticKind::CompileError => {
                tracing::warn!(route_id = ?d.route_id, detail = %d.detail, "route rejected");
            }
            DiagnosticKind::ClientError => {
                tracing::error!(detail = %d.detail, "data client error");
            }
            DiagnosticKind::TieBreak => {
                tracing::debug!(
                    route_id = ?d.route_id,
                    generation = ?d.table_generation,
                    detail = %d.detail,
                    "priority tie broken by route id"
                );
            }
            DiagnosticKind::Shutdown => {
                tracing::info!("routing controller shut down");
                break;
            }
        }
    }
}
