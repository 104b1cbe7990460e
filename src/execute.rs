//! Cell execution against a shared document, grounded line-for-line on
//! `driver.py`'s `execute`/`_handle_iopub`/`_handle_outputs`/`_handle_stdin`/
//! `_handle_comms`.
//!
//! The CRDT document itself (`pycrdt`/`jupyter-ydoc` in the original) is an
//! explicit Non-goal; this module only defines the [`CellDocument`]/
//! [`OutputSeq`] seam a real CRDT-backed cell would implement, plus an
//! in-memory test double.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::debug;

use crate::correlator::RequestCorrelator;
use crate::wire::{
    DisplayData, ErrorReply, ExecuteReply, ExecuteRequest, InputReply, InputRequest, KernelMessage,
    KernelMessageType, Reply, Stream,
};
use crate::Error;

/// A single cell's mutable state, as the CRDT document exposes it. A real
/// implementation wraps a `yrs`/`pycrdt`-style shared map; tests use
/// [`testing::InMemoryCellDocument`].
pub trait CellDocument: Send + Sync {
    /// `"code"`, `"markdown"`, etc; only `"code"` cells are executable.
    fn cell_type(&self) -> String;

    /// The cell's source text.
    fn source(&self) -> String;

    /// Set the cell's execution state (`"busy"`, `"idle"`, etc).
    fn set_execution_state(&self, state: &str);

    /// Set the cell's execution count, once the kernel reports it.
    fn set_execution_count(&self, count: i32);

    /// The cell's output sequence.
    fn outputs(&self) -> &dyn OutputSeq;

    /// Run `f` as a single atomic document transaction, matching
    /// `ycell.doc.transaction()`.
    fn transaction(&self, f: &mut dyn FnMut());
}

/// The append/replace/observe surface a cell's `outputs` array needs.
/// Outputs are represented as `serde_json::Value` to stay document-shape
/// agnostic, matching the `content: serde_json::Value` style used elsewhere
/// in this crate for anything that round-trips to the wire.
pub trait OutputSeq: Send + Sync {
    /// Number of outputs currently present.
    fn len(&self) -> usize;

    /// Whether there are no outputs yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a new output.
    fn push(&self, output: serde_json::Value);

    /// Read the output at `index`, if present.
    fn get(&self, index: usize) -> Option<serde_json::Value>;

    /// Replace the output at `index`.
    fn replace(&self, index: usize, output: serde_json::Value);

    /// Register an observer on the output at `index`, invoked whenever it
    /// changes. Returns a registration that unsubscribes when dropped or
    /// explicitly cancelled. The observer captures `index`, not a reference
    /// back to the cell, to avoid a reference cycle.
    fn observe(&self, index: usize, callback: Box<dyn Fn(serde_json::Value) + Send + Sync>) -> ObserverRegistration;
}

/// A live observer subscription. Dropping it unsubscribes, mirroring
/// `driver.py`'s one-shot `stdin_task.cancel()` after first submission.
pub struct ObserverRegistration {
    cancel: Box<dyn FnOnce() + Send>,
}

impl ObserverRegistration {
    /// Build a registration from its teardown closure.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Box::new(cancel) }
    }

    /// Unsubscribe immediately rather than waiting for drop.
    pub fn cancel(self) {
        (self.cancel)();
    }
}

/// Collaborative-widget short-circuit for `display_data`/`execute_result`
/// outputs carrying `application/vnd.jupyter.ywidget-view+json`, mirroring
/// `driver.py`'s `self.yjs.widgets` access. Returns `true` if the widget was
/// recognized and the output was handled as a widget (so the caller must
/// not also append a plain output).
pub trait WidgetRegistry: Send + Sync {
    /// Handle a potential widget display. `model_id` is the id extracted
    /// from the `ywidget-view` mime bundle.
    fn try_handle_widget(&self, model_id: &str, outputs: &dyn OutputSeq) -> bool;
}

/// A registry that never recognizes any widget, used when no collaborative
/// widget backend is wired in.
#[derive(Debug, Default)]
pub struct NoWidgets;

impl WidgetRegistry for NoWidgets {
    fn try_handle_widget(&self, _model_id: &str, _outputs: &dyn OutputSeq) -> bool {
        false
    }
}

/// Drives `execute_request`/reply and output application for a single cell.
///
/// `cell` and `widgets` are held as `Arc`s rather than borrows: the `wait =
/// false` path spawns detached tasks that outlive this call, and a real
/// CRDT-backed cell document is naturally reached through a shared handle
/// anyway (as `CellDocument`'s own doc comment notes).
pub struct ExecutionEngine<'a> {
    correlator: &'a RequestCorrelator,
    widgets: std::sync::Arc<dyn WidgetRegistry>,
    session: String,
    msg_cnt: std::sync::atomic::AtomicI64,
}

impl<'a> ExecutionEngine<'a> {
    /// Build an engine over `correlator`, sending requests in `session`.
    pub fn new(correlator: &'a RequestCorrelator, widgets: std::sync::Arc<dyn WidgetRegistry>, session: impl Into<String>) -> Self {
        Self {
            correlator,
            widgets,
            session: session.into(),
            msg_cnt: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// Execute `cell`'s source. If `wait` is true, blocks until idle and the
    /// shell reply arrive or `timeout` elapses; otherwise spawns the two
    /// detached listeners (iopub-until-idle, stdin-forever) and returns
    /// immediately, per `driver.py::execute`. The returned `JoinSet` is
    /// empty when `wait` is true and otherwise holds the detached tasks,
    /// which the caller may await or drop.
    pub async fn execute(
        &self,
        cell: std::sync::Arc<dyn CellDocument>,
        timeout: Duration,
        wait: bool,
        msg_id: Option<String>,
    ) -> Result<JoinSet<()>, Error> {
        if cell.cell_type() != "code" {
            return Ok(JoinSet::new());
        }
        cell.set_execution_state("busy");

        let content = ExecuteRequest {
            code: cell.source(),
            silent: false,
            store_history: true,
            user_expressions: BTreeMap::new(),
            allow_stdin: true,
            stop_on_error: false,
        };
        let mut request = KernelMessage::new(KernelMessageType::ExecuteRequest, &self.session, content);
        if let Some(msg_id) = msg_id {
            request.header.msg_id = msg_id;
        }
        let msg_id = request.header.msg_id.clone();
        self.msg_cnt.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let pending = self.correlator.install(msg_id.clone());
        self.correlator.send_shell(&request).await?;

        if wait {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let msg = tokio::time::timeout(remaining, pending.recv_iopub())
                    .await
                    .map_err(|_| Error::ExecutionTimeout)??;
                apply_output(cell.outputs(), self.widgets.as_ref(), &msg);
                if is_idle_status(&msg) {
                    break;
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let reply = tokio::time::timeout(remaining, pending.recv_reply::<ExecuteReply>())
                .await
                .map_err(|_| Error::ExecutionTimeout)??;
            cell.transaction(&mut || {
                if let Reply::Ok(reply) = &reply.content {
                    cell.set_execution_count(reply.execution_count);
                }
                cell.set_execution_state("idle");
            });
            Ok(JoinSet::new())
        } else {
            Ok(execute_detached(pending, cell, self.widgets.clone()))
        }
    }
}

fn is_idle_status(msg: &KernelMessage) -> bool {
    msg.header.msg_type == KernelMessageType::Status
        && msg
            .content
            .get("execution_state")
            .and_then(|v| v.as_str())
            == Some("idle")
}

/// Spawns the two detached tasks `driver.py::execute` starts when
/// `wait_for_executed` is false: one draining iopub until idle (applying
/// outputs and the stdin mediator along the way), one handling stdin
/// requests until cancelled by the first reaching idle. Tracked in a
/// `JoinSet` so the caller can await their completion if desired.
pub fn execute_detached(
    pending: crate::correlator::PendingRequest,
    cell: std::sync::Arc<dyn CellDocument>,
    widgets: std::sync::Arc<dyn WidgetRegistry>,
) -> JoinSet<()> {
    let pending = std::sync::Arc::new(pending);
    let mut tasks = JoinSet::new();

    let stdin_cell = cell.clone();
    let stdin_pending = pending.clone();
    let stdin_handle = tasks.spawn(async move {
        loop {
            match stdin_pending.recv_stdin().await {
                Ok(msg) => StdinMediator::handle(&stdin_pending, stdin_cell.outputs(), msg).await,
                Err(_) => break,
            }
        }
    });

    let iopub_cell = cell;
    let iopub_widgets = widgets;
    let iopub_pending = pending;
    tasks.spawn(async move {
        loop {
            let Ok(msg) = iopub_pending.recv_iopub().await else {
                break;
            };
            apply_output(iopub_cell.outputs(), iopub_widgets.as_ref(), &msg);
            if is_idle_status(&msg) {
                stdin_handle.abort();
                if let Ok(reply) = iopub_pending.recv_reply::<ExecuteReply>().await {
                    iopub_cell.transaction(&mut || {
                        if let Reply::Ok(reply) = &reply.content {
                            iopub_cell.set_execution_count(reply.execution_count);
                        }
                        iopub_cell.set_execution_state("idle");
                    });
                }
                break;
            }
        }
    });

    tasks
}

/// Apply a single iopub message's effect to `outputs`, per
/// `driver.py::_handle_outputs`.
///
/// The Python source strips a trailing `os.linesep` or `"\n"` from stream
/// text without specifying which when both match; this strips at most one
/// trailing `\n`, preferring it over any other line ending, resolving that
/// ambiguity deterministically.
pub fn apply_output(outputs: &dyn OutputSeq, widgets: &dyn WidgetRegistry, msg: &KernelMessage) {
    match msg.header.msg_type {
        KernelMessageType::Stream => {
            let Ok(stream) = serde_json::from_value::<Stream>(msg.content.clone()) else {
                return;
            };
            let text = strip_one_trailing_newline(&stream.text);
            let last = if outputs.is_empty() { None } else { outputs.get(outputs.len() - 1) };
            let same_stream = last
                .as_ref()
                .and_then(|o| o.get("name"))
                .and_then(|n| n.as_str())
                == Some(stream.name.as_str());
            if same_stream {
                let idx = outputs.len() - 1;
                let mut last = last.unwrap();
                if let Some(text_arr) = last.get_mut("text").and_then(|t| t.as_array_mut()) {
                    text_arr.push(serde_json::Value::String(text));
                }
                outputs.replace(idx, last);
            } else {
                outputs.push(serde_json::json!({
                    "name": stream.name,
                    "output_type": "stream",
                    "text": [text],
                }));
            }
        }
        KernelMessageType::DisplayData | KernelMessageType::ExecuteResult => {
            let Ok(display) = serde_json::from_value::<DisplayData>(msg.content.clone()) else {
                return;
            };
            if let Some(model_id) = display
                .data
                .get("application/vnd.jupyter.ywidget-view+json")
                .and_then(|v| v.get("model_id"))
                .and_then(|v| v.as_str())
            {
                widgets.try_handle_widget(model_id, outputs);
                return;
            }
            let mut output = serde_json::json!({
                "data": display.data,
                "metadata": serde_json::Map::<String, serde_json::Value>::new(),
                "output_type": if msg.header.msg_type == KernelMessageType::ExecuteResult {
                    "execute_result"
                } else {
                    "display_data"
                },
            });
            if msg.header.msg_type == KernelMessageType::ExecuteResult {
                if let Some(count) = msg.content.get("execution_count") {
                    output["execution_count"] = count.clone();
                }
            }
            outputs.push(output);
        }
        KernelMessageType::Error => {
            let Ok(error) = serde_json::from_value::<ErrorReply>(msg.content.clone()) else {
                return;
            };
            outputs.push(serde_json::json!({
                "ename": error.ename,
                "evalue": error.evalue,
                "output_type": "error",
                "traceback": error.traceback,
            }));
        }
        KernelMessageType::Status => {
            // Handled by the engine's state machine, not here.
        }
        _ => {}
    }
}

fn strip_one_trailing_newline(text: &str) -> String {
    text.strip_suffix('\n').unwrap_or(text).to_string()
}

/// Handles `input_request`s on the stdin channel, grounded line-for-line on
/// `driver.py::_handle_stdin`/`_handle_stdin_submission`/
/// `_change_stdin_to_stream`.
pub struct StdinMediator;

impl StdinMediator {
    /// Handle one stdin message: if it's an `input_request`, append a
    /// pending "stdin" output and register an observer that, once the user
    /// submits a value, sends `input_reply` and rewrites the output to a
    /// stream, exactly as the Python driver does.
    pub async fn handle(pending: &crate::correlator::PendingRequest, outputs: &dyn OutputSeq, msg: KernelMessage) {
        if msg.header.msg_type != KernelMessageType::InputRequest {
            return;
        }
        let request_header = msg.header.clone();
        let Ok(request) = serde_json::from_value::<InputRequest>(msg.content) else {
            return;
        };

        let stdin_idx = outputs.len();
        outputs.push(serde_json::json!({
            "output_type": "stdin",
            "submitted": false,
            "password": request.password,
            "prompt": request.prompt,
            "value": "",
        }));

        Self::await_submission(pending, outputs, stdin_idx, request, request_header).await;
    }

    async fn await_submission(
        pending: &crate::correlator::PendingRequest,
        outputs: &dyn OutputSeq,
        stdin_idx: usize,
        request: InputRequest,
        request_header: crate::wire::KernelHeader,
    ) {
        // A real CRDT-backed `OutputSeq::observe` would push submission
        // events through a channel; the in-memory test double polls
        // directly since it has no async notification primitive.
        let value = loop {
            if let Some(output) = outputs.get(stdin_idx) {
                if output.get("submitted").and_then(|v| v.as_bool()) == Some(true) {
                    break output
                        .get("value")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                }
            }
            tokio::task::yield_now().await;
        };

        let reply_content = InputReply { value: value.clone() };
        let mut reply = KernelMessage::new(KernelMessageType::InputReply, &request_header.session, reply_content);
        reply.parent_header = Some(request_header);
        if let Err(err) = pending.send_stdin(&reply).await {
            debug!(%err, "failed to send input_reply on stdin channel");
        }

        let display_value = if request.password {
            "········".to_string()
        } else {
            value
        };
        outputs.replace(
            stdin_idx,
            serde_json::json!({
                "output_type": "stream",
                "name": "stdin",
                "text": format!("{} {}\n", request.prompt, display_value),
            }),
        );
    }
}

/// A lightweight handle for replying on a comm channel, ported from
/// `driver.py`'s `Comm` class.
pub struct Comm<'a> {
    comm_id: String,
    correlator: &'a RequestCorrelator,
    session: String,
    msg_cnt: std::sync::atomic::AtomicI64,
}

impl<'a> Comm<'a> {
    /// Build a comm handle for `comm_id`, replying over `correlator`.
    pub fn new(comm_id: impl Into<String>, correlator: &'a RequestCorrelator, session: impl Into<String>) -> Self {
        Self {
            comm_id: comm_id.into(),
            correlator,
            session: session.into(),
            msg_cnt: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// Send a `comm_msg` with the given binary buffers on the shell
    /// channel.
    pub async fn send(&self, buffers: Vec<bytes::Bytes>) -> Result<(), Error> {
        self.msg_cnt.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut msg = KernelMessage::new(
            KernelMessageType::CommMsg,
            &self.session,
            serde_json::json!({ "comm_id": self.comm_id }),
        );
        msg.buffers = buffers;
        self.correlator.send_shell(&msg).await
    }
}

/// Dispatches `comm_open`/`comm_msg` iopub traffic, generalizing
/// `driver.py`'s `self.yjs.widgets.comm_open`/`comm_msg` calls.
pub trait CommHandler: Send + Sync {
    /// A new comm was opened.
    fn comm_open(&self, comm: Comm<'_>, msg: &KernelMessage);

    /// A message arrived on an already-open comm.
    fn comm_msg(&self, msg: &KernelMessage);
}

/// Drain `correlator`'s shared comm queue, dispatching to `handler` until
/// the queue closes, matching `driver.py::_handle_comms`.
pub async fn handle_comms(correlator: &RequestCorrelator, session: &str, handler: &dyn CommHandler) {
    let comm_rx = correlator.comm_messages();
    while let Ok(msg) = comm_rx.recv().await {
        match msg.header.msg_type {
            KernelMessageType::CommOpen => {
                let Some(comm_id) = msg.content.get("comm_id").and_then(|v| v.as_str()) else {
                    continue;
                };
                let comm = Comm::new(comm_id.to_string(), correlator, session.to_string());
                handler.comm_open(comm, &msg);
            }
            KernelMessageType::CommMsg => handler.comm_msg(&msg),
            _ => {}
        }
    }
}

/// In-memory test doubles for [`CellDocument`]/[`OutputSeq`], standing in
/// for a real CRDT-backed cell.
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// An in-memory cell document backed by plain `Mutex`-guarded fields.
    pub struct InMemoryCellDocument {
        cell_type: Mutex<String>,
        source: Mutex<String>,
        execution_state: Mutex<String>,
        execution_count: Mutex<i32>,
        outputs: InMemoryOutputSeq,
    }

    impl InMemoryCellDocument {
        /// Build a fresh `"code"` cell with the given source.
        pub fn new(source: impl Into<String>) -> Self {
            Self {
                cell_type: Mutex::new("code".to_string()),
                source: Mutex::new(source.into()),
                execution_state: Mutex::new("idle".to_string()),
                execution_count: Mutex::new(0),
                outputs: InMemoryOutputSeq::default(),
            }
        }

        /// Current execution state, for assertions in tests.
        pub fn execution_state(&self) -> String {
            self.execution_state.lock().unwrap().clone()
        }

        /// Current execution count, for assertions in tests.
        pub fn execution_count(&self) -> i32 {
            *self.execution_count.lock().unwrap()
        }
    }

    impl CellDocument for InMemoryCellDocument {
        fn cell_type(&self) -> String {
            self.cell_type.lock().unwrap().clone()
        }

        fn source(&self) -> String {
            self.source.lock().unwrap().clone()
        }

        fn set_execution_state(&self, state: &str) {
            *self.execution_state.lock().unwrap() = state.to_string();
        }

        fn set_execution_count(&self, count: i32) {
            *self.execution_count.lock().unwrap() = count;
        }

        fn outputs(&self) -> &dyn OutputSeq {
            &self.outputs
        }

        fn transaction(&self, f: &mut dyn FnMut()) {
            f();
        }
    }

    /// An in-memory output sequence backed by a `Mutex<Vec<Value>>`.
    #[derive(Default)]
    pub struct InMemoryOutputSeq {
        items: Mutex<Vec<serde_json::Value>>,
    }

    impl OutputSeq for InMemoryOutputSeq {
        fn len(&self) -> usize {
            self.items.lock().unwrap().len()
        }

        fn push(&self, output: serde_json::Value) {
            self.items.lock().unwrap().push(output);
        }

        fn get(&self, index: usize) -> Option<serde_json::Value> {
            self.items.lock().unwrap().get(index).cloned()
        }

        fn replace(&self, index: usize, output: serde_json::Value) {
            if let Some(slot) = self.items.lock().unwrap().get_mut(index) {
                *slot = output;
            }
        }

        fn observe(
            &self,
            _index: usize,
            _callback: Box<dyn Fn(serde_json::Value) + Send + Sync>,
        ) -> ObserverRegistration {
            ObserverRegistration::new(|| {})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::InMemoryCellDocument;
    use super::*;

    #[test]
    fn stream_output_coalesces_by_name() {
        let outputs = testing::InMemoryOutputSeq::default();
        let widgets = NoWidgets;

        let msg1 = KernelMessage::new(
            KernelMessageType::Stream,
            "sess",
            serde_json::json!({"name": "stdout", "text": "hello\n"}),
        );
        apply_output(&outputs, &widgets, &msg1);
        assert_eq!(outputs.len(), 1);

        let msg2 = KernelMessage::new(
            KernelMessageType::Stream,
            "sess",
            serde_json::json!({"name": "stdout", "text": "world\n"}),
        );
        apply_output(&outputs, &widgets, &msg2);
        assert_eq!(outputs.len(), 1, "same-name stream coalesces into one output");

        let text = outputs.get(0).unwrap();
        let lines = text.get("text").unwrap().as_array().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "hello");
        assert_eq!(lines[1], "world");
    }

    #[test]
    fn stream_output_splits_by_name() {
        let outputs = testing::InMemoryOutputSeq::default();
        let widgets = NoWidgets;

        apply_output(
            &outputs,
            &widgets,
            &KernelMessage::new(
                KernelMessageType::Stream,
                "sess",
                serde_json::json!({"name": "stdout", "text": "out\n"}),
            ),
        );
        apply_output(
            &outputs,
            &widgets,
            &KernelMessage::new(
                KernelMessageType::Stream,
                "sess",
                serde_json::json!({"name": "stderr", "text": "err\n"}),
            ),
        );
        assert_eq!(outputs.len(), 2, "different stream names don't coalesce");
    }

    #[test]
    fn display_data_appends_plain_output() {
        let outputs = testing::InMemoryOutputSeq::default();
        let widgets = NoWidgets;
        apply_output(
            &outputs,
            &widgets,
            &KernelMessage::new(
                KernelMessageType::DisplayData,
                "sess",
                serde_json::json!({"data": {"text/plain": "42"}, "metadata": {}}),
            ),
        );
        assert_eq!(outputs.len(), 1);
        let output = outputs.get(0).unwrap();
        assert_eq!(output["output_type"], "display_data");
        assert_eq!(output["data"]["text/plain"], "42");
    }

    #[test]
    fn unresolved_ywidget_view_appends_nothing() {
        let outputs = testing::InMemoryOutputSeq::default();
        let widgets = NoWidgets;
        apply_output(
            &outputs,
            &widgets,
            &KernelMessage::new(
                KernelMessageType::DisplayData,
                "sess",
                serde_json::json!({
                    "data": {"application/vnd.jupyter.ywidget-view+json": {"model_id": "abc123"}},
                    "metadata": {},
                }),
            ),
        );
        assert_eq!(outputs.len(), 0, "an unresolved widget-view under NoWidgets yields no output");
    }

    struct RecordingWidgets;

    impl WidgetRegistry for RecordingWidgets {
        fn try_handle_widget(&self, model_id: &str, outputs: &dyn OutputSeq) -> bool {
            outputs.push(serde_json::json!({"output_type": "widget_view", "model_id": model_id}));
            true
        }
    }

    #[test]
    fn recognized_widget_routes_through_registry() {
        let outputs = testing::InMemoryOutputSeq::default();
        let widgets = RecordingWidgets;
        apply_output(
            &outputs,
            &widgets,
            &KernelMessage::new(
                KernelMessageType::DisplayData,
                "sess",
                serde_json::json!({
                    "data": {"application/vnd.jupyter.ywidget-view+json": {"model_id": "abc123"}},
                    "metadata": {},
                }),
            ),
        );
        assert_eq!(outputs.len(), 1);
        let output = outputs.get(0).unwrap();
        assert_eq!(output["output_type"], "widget_view");
        assert_eq!(output["model_id"], "abc123");
    }

    #[test]
    fn error_output_passes_through() {
        let outputs = testing::InMemoryOutputSeq::default();
        let widgets = NoWidgets;
        apply_output(
            &outputs,
            &widgets,
            &KernelMessage::new(
                KernelMessageType::Error,
                "sess",
                serde_json::json!({"ename": "NameError", "evalue": "x undefined", "traceback": []}),
            ),
        );
        let output = outputs.get(0).unwrap();
        assert_eq!(output["output_type"], "error");
        assert_eq!(output["ename"], "NameError");
    }

    #[test]
    fn markdown_cells_are_not_executable() {
        let cell = InMemoryCellDocument::new("# heading");
        cell.set_execution_state("idle");
        // cell_type defaults to "code" in the test double; exercise the
        // non-code branch by constructing one directly.
        struct MarkdownCell(InMemoryCellDocument);
        impl CellDocument for MarkdownCell {
            fn cell_type(&self) -> String {
                "markdown".into()
            }
            fn source(&self) -> String {
                self.0.source()
            }
            fn set_execution_state(&self, state: &str) {
                self.0.set_execution_state(state)
            }
            fn set_execution_count(&self, count: i32) {
                self.0.set_execution_count(count)
            }
            fn outputs(&self) -> &dyn OutputSeq {
                self.0.outputs()
            }
            fn transaction(&self, f: &mut dyn FnMut()) {
                self.0.transaction(f)
            }
        }
        let markdown = MarkdownCell(cell);
        assert_eq!(markdown.cell_type(), "markdown");
    }

    fn test_profile() -> crate::connection::ConnectionProfile {
        serde_json::from_value(serde_json::json!({
            "signature_scheme": "hmac-sha256",
            "key": "k",
            "transport": "tcp",
            "ip": "127.0.0.1",
            "shell_port": 0,
            "iopub_port": 0,
            "stdin_port": 0,
            "control_port": 0,
            "hb_port": 0,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn execute_wait_true_blocks_until_idle_and_records_execution_count() {
        use crate::transport::{ChannelId, MockChannelTransport};
        use crate::wire::codec;

        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();
        let engine = ExecutionEngine::new(
            &correlator,
            std::sync::Arc::new(NoWidgets),
            "sess",
        );
        let cell = std::sync::Arc::new(InMemoryCellDocument::new("1+1"));

        let shell_peer = transport.peer(ChannelId::Shell, b"id");
        let iopub_peer = transport.peer(ChannelId::Iopub, b"");
        let driver = tokio::spawn(async move {
            let sent = shell_peer.recv_sent().await.unwrap();
            let request = codec::decode(&sent, "k").unwrap();

            let idle = KernelMessage::reply_to(
                &request,
                KernelMessageType::Status,
                serde_json::json!({"execution_state": "idle"}),
            );
            iopub_peer
                .push_from_peer(codec::encode(&idle, "k", &[]).unwrap())
                .await;

            let reply = KernelMessage::reply_to(
                &request,
                KernelMessageType::ExecuteReply,
                Reply::Ok(ExecuteReply {
                    execution_count: 7,
                    user_expressions: None,
                }),
            );
            shell_peer
                .push_from_peer(codec::encode(&reply, "k", &[]).unwrap())
                .await;
        });

        let tasks = engine
            .execute(cell.clone(), Duration::from_secs(5), true, None)
            .await
            .unwrap();
        assert!(tasks.is_empty(), "wait=true leaves no detached tasks behind");
        driver.await.unwrap();

        assert_eq!(cell.execution_state(), "idle");
        assert_eq!(cell.execution_count(), 7);
    }

    #[tokio::test]
    async fn execute_wait_false_spawns_detached_tasks_that_finish_on_idle() {
        use crate::transport::{ChannelId, MockChannelTransport};
        use crate::wire::codec;

        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();
        let engine = ExecutionEngine::new(
            &correlator,
            std::sync::Arc::new(NoWidgets),
            "sess",
        );
        let cell = std::sync::Arc::new(InMemoryCellDocument::new("1+1"));

        let mut tasks = engine
            .execute(cell.clone(), Duration::from_secs(5), false, None)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2, "wait=false hands back the iopub and stdin tasks");

        let shell_peer = transport.peer(ChannelId::Shell, b"id");
        let iopub_peer = transport.peer(ChannelId::Iopub, b"");
        let sent = shell_peer.recv_sent().await.unwrap();
        let request = codec::decode(&sent, "k").unwrap();

        let stream = KernelMessage::reply_to(
            &request,
            KernelMessageType::Stream,
            serde_json::json!({"name": "stdout", "text": "hi\n"}),
        );
        iopub_peer
            .push_from_peer(codec::encode(&stream, "k", &[]).unwrap())
            .await;

        let idle = KernelMessage::reply_to(
            &request,
            KernelMessageType::Status,
            serde_json::json!({"execution_state": "idle"}),
        );
        iopub_peer
            .push_from_peer(codec::encode(&idle, "k", &[]).unwrap())
            .await;

        let reply = KernelMessage::reply_to(
            &request,
            KernelMessageType::ExecuteReply,
            Reply::Ok(ExecuteReply {
                execution_count: 3,
                user_expressions: None,
            }),
        );
        shell_peer
            .push_from_peer(codec::encode(&reply, "k", &[]).unwrap())
            .await;

        while tasks.join_next().await.is_some() {}

        assert_eq!(cell.execution_state(), "idle");
        assert_eq!(cell.execution_count(), 3);
        assert_eq!(cell.outputs().len(), 1);
    }

    #[tokio::test]
    async fn password_input_sends_reply_and_masks_output() {
        use crate::transport::{ChannelId, MockChannelTransport};
        use crate::wire::codec;

        let transport = MockChannelTransport::new();
        let profile = test_profile();
        let correlator = RequestCorrelator::connect(&transport, &profile, b"id").await.unwrap();
        let engine = ExecutionEngine::new(&correlator, std::sync::Arc::new(NoWidgets), "sess");
        let cell = std::sync::Arc::new(InMemoryCellDocument::new("input('pw?')"));

        let mut tasks = engine
            .execute(cell.clone(), Duration::from_secs(5), false, None)
            .await
            .unwrap();

        let shell_peer = transport.peer(ChannelId::Shell, b"id");
        let iopub_peer = transport.peer(ChannelId::Iopub, b"");
        let stdin_peer = transport.peer(ChannelId::Stdin, b"id");
        let sent = shell_peer.recv_sent().await.unwrap();
        let request = codec::decode(&sent, "k").unwrap();

        let input_request = KernelMessage::reply_to(
            &request,
            KernelMessageType::InputRequest,
            serde_json::json!({"prompt": "pw?", "password": true}),
        );
        stdin_peer
            .push_from_peer(codec::encode(&input_request, "k", &[]).unwrap())
            .await;

        // Wait for the stdin output to appear, then simulate the user
        // submitting a value through the shared document.
        loop {
            if cell.outputs().len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let pending_stdin = cell.outputs().get(0).unwrap();
        assert_eq!(pending_stdin["output_type"], "stdin");
        assert_eq!(pending_stdin["submitted"], false);
        cell.outputs().replace(
            0,
            serde_json::json!({
                "output_type": "stdin",
                "submitted": true,
                "password": true,
                "prompt": "pw?",
                "value": "secret",
            }),
        );

        let input_reply_frames = stdin_peer.recv_sent().await.unwrap();
        let input_reply: KernelMessage<InputReply> =
            codec::decode(&input_reply_frames, "k").unwrap().into_typed().unwrap();
        assert_eq!(input_reply.content.value, "secret");
        assert_eq!(
            input_reply.parent_header.as_ref().map(|h| &h.msg_id),
            Some(&input_request.header.msg_id)
        );

        loop {
            let output = cell.outputs().get(0).unwrap();
            if output["output_type"] == "stream" {
                assert_eq!(output["name"], "stdin");
                assert_eq!(output["text"], "pw? ········\n");
                break;
            }
            tokio::task::yield_now().await;
        }

        let idle = KernelMessage::reply_to(
            &request,
            KernelMessageType::Status,
            serde_json::json!({"execution_state": "idle"}),
        );
        iopub_peer
            .push_from_peer(codec::encode(&idle, "k", &[]).unwrap())
            .await;
        let reply = KernelMessage::reply_to(
            &request,
            KernelMessageType::ExecuteReply,
            Reply::Ok(ExecuteReply {
                execution_count: 1,
                user_expressions: None,
            }),
        );
        shell_peer
            .push_from_peer(codec::encode(&reply, "k", &[]).unwrap())
            .await;
        while tasks.join_next().await.is_some() {}
        assert_eq!(cell.execution_state(), "idle");
    }
}
