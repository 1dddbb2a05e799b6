//! Client side of the embedded Neovim session.
//!
//! One writer (the application thread plus fire-and-forget input calls) and
//! one background reader thread. The reader never blocks anyone: redraw
//! notifications and option changes land in [`PendingQueue`]s drained once
//! per tick, responses are routed to the waiting caller by msgid, and the
//! reader going away is signalled through a one-shot exit flag.

pub mod rpc;

use std::collections::HashMap;
use std::io::Read;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use rmpv::Value;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::queue::PendingQueue;
use rpc::Message;

/// Oldest backend version the line-grid protocol we speak is valid for.
const MIN_VERSION: (u64, u64) = (0, 4);

/// Notification method fed by the `QuadroSet` user command registered at
/// attach time.
const OPTION_SET_EVENT: &str = "quadro_option_set";

/// Vimscript registered into the backend so users can push option changes
/// to the front-end at runtime. `CHANID` is replaced with our channel id.
const OPTION_SET_SCRIPT: &str = "
function QuadroOptionSet(...)
    if a:0 != 2
        echoerr 'QuadroSet needs 2 arguments.'
        return
    endif
    call rpcnotify(CHANID, 'quadro_option_set', a:1, a:2)
endfunction
command -nargs=+ QuadroSet call QuadroOptionSet(<f-args>)
";

/// All tagged update records from one `redraw` notification, in arrival
/// order. Many of these may pile up between ticks.
#[derive(Debug, Clone)]
pub struct UpdateBatch(pub Vec<Value>);

/// A `{name, value}` pair pushed from the backend. Within one drain a later
/// entry for the same name wins by simply being applied after the earlier
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionChange {
    pub name: String,
    pub value: String,
}

type ReplySender = mpsc::Sender<(Value, Value)>;

/// State shared between the writer side and the reader thread.
struct Shared {
    redraw: PendingQueue<UpdateBatch>,
    options: PendingQueue<OptionChange>,
    replies: Mutex<HashMap<u64, ReplySender>>,
    exited: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            redraw: PendingQueue::new(),
            options: PendingQueue::new(),
            replies: Mutex::new(HashMap::new()),
            exited: AtomicBool::new(false),
        }
    }
}

pub struct NvimClient {
    child: Child,
    writer: Mutex<ChildStdin>,
    next_msgid: AtomicU64,
    shared: Arc<Shared>,
    reader: Option<thread::JoinHandle<()>>,
    channel_id: u64,
}

impl NvimClient {
    /// Spawn the backend process in embedded mode with piped stdio.
    /// Failure here is fatal for the session.
    pub fn spawn(exec_path: &str, extra_args: &[String]) -> Result<Self> {
        let mut child = Command::new(exec_path)
            .arg("--embed")
            .args(extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(Error::Startup)?;
        debug!(exec_path, ?extra_args, "backend process started");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Startup(std::io::Error::other("child stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Startup(std::io::Error::other("child stdout unavailable")))?;

        let shared = Arc::new(Shared::new());
        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("nvim-reader".into())
            .spawn(move || pump_messages(stdout, &reader_shared))
            .map_err(Error::Startup)?;

        Ok(Self {
            child,
            writer: Mutex::new(stdin),
            next_msgid: AtomicU64::new(1),
            shared,
            reader: Some(reader),
            channel_id: 0,
        })
    }

    /// Negotiate capabilities and attach as a UI.
    ///
    /// Requests the line-oriented grid protocol unconditionally and the
    /// multi-grid extension when asked for. Fails fatally when the backend
    /// is older than [`MIN_VERSION`].
    pub fn attach_ui(&mut self, rows: u64, cols: u64, multigrid: bool) -> Result<()> {
        let api_info = self.request("nvim_get_api_info", vec![])?;
        let (channel_id, version) = parse_api_info(&api_info)?;
        self.channel_id = channel_id;
        if version < MIN_VERSION {
            return Err(Error::Handshake(format!(
                "backend version {}.{} is older than supported {}.{}",
                version.0, version.1, MIN_VERSION.0, MIN_VERSION.1
            )));
        }
        debug!(major = version.0, minor = version.1, channel_id, "backend handshake complete");

        self.introduce();
        self.register_option_command();

        let mut ui_options = Vec::new();
        ui_options.push((Value::from("rgb"), Value::from(true)));
        ui_options.push((Value::from("ext_linegrid"), Value::from(true)));
        if multigrid {
            ui_options.push((Value::from("ext_multigrid"), Value::from(true)));
            debug!("multigrid enabled");
        }
        self.request(
            "nvim_ui_attach",
            vec![
                Value::from(cols),
                Value::from(rows),
                Value::Map(ui_options),
            ],
        )?;
        debug!(rows, cols, "attached as a ui client");
        Ok(())
    }

    /// Identify ourselves to the backend so `:checkhealth` and friends can
    /// name the attached client.
    fn introduce(&self) {
        let version = Value::Map(vec![
            (Value::from("major"), Value::from(0u64)),
            (Value::from("minor"), Value::from(1u64)),
            (Value::from("patch"), Value::from(0u64)),
        ]);
        let result = self.request(
            "nvim_set_client_info",
            vec![
                Value::from("quadro"),
                version,
                Value::from("ui"),
                Value::Map(vec![]),
                Value::Map(vec![]),
            ],
        );
        if let Err(err) = result {
            warn!(%err, "failed to set client info");
        }
    }

    fn register_option_command(&self) {
        let script = OPTION_SET_SCRIPT.replace("CHANID", &self.channel_id.to_string());
        let result = self.request(
            "nvim_exec2",
            vec![Value::from(script.trim()), Value::Map(vec![])],
        );
        if let Err(err) = result {
            warn!(%err, "failed to register option command");
        }
    }

    /// Forward one encoded key token. At-most-once by design: a dropped
    /// keystroke is better than a duplicated one, so a transmission failure
    /// is logged and the token is gone.
    pub fn input(&self, keys: &str) {
        if let Err(err) = self.notify("nvim_input", vec![Value::from(keys)]) {
            warn!(%err, keys, "dropped key input");
        }
    }

    /// Forward one mouse event. Same at-most-once contract as [`input`].
    ///
    /// [`input`]: NvimClient::input
    pub fn input_mouse(
        &self,
        button: &str,
        action: &str,
        modifiers: &str,
        grid: i64,
        row: i64,
        col: i64,
    ) {
        let params = vec![
            Value::from(button),
            Value::from(action),
            Value::from(modifiers),
            Value::from(grid),
            Value::from(row),
            Value::from(col),
        ];
        if let Err(err) = self.notify("nvim_input_mouse", params) {
            warn!(%err, button, action, "dropped mouse input");
        }
    }

    pub fn open_file(&self, path: &str) {
        self.command(&format!("edit {}", path));
    }

    pub fn goto_line(&self, line: i64) {
        trace!(line, "goto line");
        if let Err(err) = self.request(
            "nvim_call_function",
            vec![
                Value::from("cursor"),
                Value::Array(vec![Value::from(line), Value::from(0)]),
            ],
        ) {
            warn!(%err, "cursor() call failed");
        }
    }

    pub fn goto_column(&self, col: i64) {
        trace!(col, "goto column");
        if let Err(err) = self.request(
            "nvim_call_function",
            vec![
                Value::from("cursor"),
                Value::Array(vec![Value::from(0), Value::from(col)]),
            ],
        ) {
            warn!(%err, "cursor() call failed");
        }
    }

    /// Execute an ex command, logging instead of failing the session.
    pub fn command(&self, cmd: &str) -> bool {
        debug!(cmd, "executing command");
        match self.request("nvim_command", vec![Value::from(cmd)]) {
            Ok(_) => true,
            Err(err) => {
                warn!(%err, cmd, "command execution failed");
                false
            }
        }
    }

    /// Ask the backend to lay the default grid out with the given size.
    pub fn try_resize_ui(&self, rows: i64, cols: i64) {
        if rows <= 0 || cols <= 0 {
            return;
        }
        if let Err(err) = self.request(
            "nvim_ui_try_resize",
            vec![Value::from(cols), Value::from(rows)],
        ) {
            warn!(%err, "resize request failed");
        }
    }

    /// Queued redraw batches. Main thread only, once per tick.
    pub fn drain_redraw(&self) -> Vec<UpdateBatch> {
        self.shared.redraw.drain()
    }

    /// Queued option changes. Main thread only, once per tick.
    pub fn drain_options(&self) -> Vec<OptionChange> {
        self.shared.options.drain()
    }

    /// One-shot session termination signal, set when the reader observes
    /// EOF or a fatal I/O error on the backend channel.
    pub fn exited(&self) -> bool {
        self.shared.exited.load(Ordering::Acquire)
    }

    /// Tell the backend to quit; it will close the channel and the exit
    /// flag fires through the reader.
    pub fn quit(&self) {
        self.command("qa!");
    }

    /// Ordered teardown of the backend process.
    pub fn close(&mut self) {
        if !self.exited() {
            self.quit();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        match self.child.wait() {
            Ok(status) => debug!(%status, "backend process finished"),
            Err(err) => warn!(%err, "failed to wait for backend process"),
        }
    }

    /// Blocking request/response. Only the handshake and the infrequent
    /// dispatch operations go through here; interactive input never does.
    fn request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        // The reader clears the reply map right after setting the exit
        // flag, so a slot inserted past this check still gets dropped and
        // the recv below errors instead of blocking forever. Without the
        // check, a half-closed backend (stdout gone, stdin still writable)
        // would leave the caller waiting on a reply that can never arrive.
        if self.exited() {
            return Err(Error::Transport(std::io::Error::other(
                "backend channel closed",
            )));
        }
        let msgid = self.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.shared.replies.lock().insert(msgid, tx);

        let write_result = {
            let mut writer = self.writer.lock();
            rpc::write_request(&mut *writer, msgid, method, params)
        };
        if let Err(err) = write_result {
            self.shared.replies.lock().remove(&msgid);
            return Err(err);
        }

        let (error, result) = rx.recv().map_err(|_| {
            Error::Transport(std::io::Error::other("backend channel closed"))
        })?;
        if error.is_nil() {
            Ok(result)
        } else {
            Err(Error::Protocol(format!("{method}: {error}")))
        }
    }

    /// One write, no reply expected.
    fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        let mut writer = self.writer.lock();
        rpc::write_notification(&mut *writer, method, params)
    }
}

/// Reader loop body. Decodes messages until the channel dies, then fires
/// the one-shot exit flag. Split out from the thread spawn so it can be
/// driven from a byte buffer in tests.
fn pump_messages(mut reader: impl Read, shared: &Shared) {
    loop {
        match rpc::read_message(&mut reader) {
            Ok(Message::Notification { method, params }) => {
                dispatch_notification(&method, params, shared)
            }
            Ok(Message::Response {
                msgid,
                error,
                result,
            }) => {
                let sender = shared.replies.lock().remove(&msgid);
                match sender {
                    // Caller may have given up after a write failure.
                    Some(sender) => drop(sender.send((error, result))),
                    None => trace!(msgid, "reply without a waiting caller"),
                }
            }
            Ok(Message::Request { msgid, method, .. }) => {
                // We advertise no methods, so nothing valid can arrive here.
                trace!(msgid, method, "ignoring backend-initiated request");
            }
            Err(Error::Protocol(reason)) => {
                warn!(reason, "skipping malformed backend message");
            }
            Err(err) => {
                if !shared.exited.swap(true, Ordering::AcqRel) {
                    debug!(%err, "backend channel closed");
                }
                // Unblock any caller still waiting on a reply.
                shared.replies.lock().clear();
                return;
            }
        }
    }
}

fn dispatch_notification(method: &str, params: Vec<Value>, shared: &Shared) {
    match method {
        "redraw" => shared.redraw.push(UpdateBatch(params)),
        OPTION_SET_EVENT => match parse_option_change(params) {
            Some(change) => shared.options.push(change),
            // Not a user mistake: the registered command only sends strings.
            None => warn!("option change arguments are not strings"),
        },
        other => trace!(method = other, "ignoring notification"),
    }
}

fn parse_option_change(params: Vec<Value>) -> Option<OptionChange> {
    let mut params = params.into_iter();
    let name = into_string(params.next()?)?;
    let value = into_string(params.next()?)?;
    Some(OptionChange { name, value })
}

fn into_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => s.into_str(),
        _ => None,
    }
}

/// `nvim_get_api_info` returns `[channel_id, metadata]` where the metadata
/// map carries a `version` map with major/minor/patch entries.
fn parse_api_info(info: &Value) -> Result<(u64, (u64, u64))> {
    let fields = info
        .as_array()
        .ok_or_else(|| Error::Protocol("api info is not an array".into()))?;
    let channel_id = fields
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Protocol("api info has no channel id".into()))?;
    let metadata = fields
        .get(1)
        .and_then(Value::as_map)
        .ok_or_else(|| Error::Protocol("api info has no metadata map".into()))?;
    let version = map_get(metadata, "version")
        .and_then(Value::as_map)
        .ok_or_else(|| Error::Protocol("api info has no version map".into()))?;
    let major = map_get(version, "major").and_then(Value::as_u64).unwrap_or(0);
    let minor = map_get(version, "minor").and_then(Value::as_u64).unwrap_or(0);
    Ok((channel_id, (major, minor)))
}

fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_notification(method: &str, params: Vec<Value>) -> Vec<u8> {
        let mut buf = Vec::new();
        rpc::write_notification(&mut buf, method, params).unwrap();
        buf
    }

    #[test]
    fn redraw_notifications_queue_in_arrival_order() {
        let mut bytes = Vec::new();
        bytes.extend(encode_notification(
            "redraw",
            vec![Value::Array(vec![Value::from("grid_resize")])],
        ));
        bytes.extend(encode_notification(
            "redraw",
            vec![Value::Array(vec![Value::from("grid_line")])],
        ));

        let shared = Shared::new();
        pump_messages(Cursor::new(bytes), &shared);

        let batches = shared.redraw.drain();
        assert_eq!(batches.len(), 2);
        assert_eq!(
            batches[0].0[0].as_array().unwrap()[0].as_str(),
            Some("grid_resize")
        );
        assert_eq!(
            batches[1].0[0].as_array().unwrap()[0].as_str(),
            Some("grid_line")
        );
        // EOF fires the one-shot exit flag.
        assert!(shared.exited.load(Ordering::Acquire));
    }

    #[test]
    fn option_changes_are_parsed_and_queued() {
        let bytes = encode_notification(
            OPTION_SET_EVENT,
            vec![Value::from("TargetTPS"), Value::from("120")],
        );
        let shared = Shared::new();
        pump_messages(Cursor::new(bytes), &shared);

        assert_eq!(
            shared.options.drain(),
            vec![OptionChange {
                name: "TargetTPS".into(),
                value: "120".into(),
            }]
        );
    }

    #[test]
    fn responses_route_to_the_waiting_caller() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(
            &mut buf,
            &Value::Array(vec![
                Value::from(1u64),
                Value::from(9u64),
                Value::Nil,
                Value::from("result"),
            ]),
        )
        .unwrap();

        let shared = Shared::new();
        let (tx, rx) = mpsc::channel();
        shared.replies.lock().insert(9, tx);
        pump_messages(Cursor::new(buf), &shared);

        let (error, result) = rx.recv().unwrap();
        assert!(error.is_nil());
        assert_eq!(result.as_str(), Some("result"));
    }

    #[test]
    fn request_fails_fast_after_the_backend_goes_away() {
        use std::time::{Duration, Instant};

        // A process that exits immediately stands in for a dead backend:
        // its stdout closes, the reader observes EOF and fires the exit
        // flag.
        let mut client = NvimClient::spawn("true", &[]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !client.exited() {
            assert!(Instant::now() < deadline, "reader never observed the exit");
            thread::sleep(Duration::from_millis(10));
        }

        match client.request("nvim_get_api_info", vec![]) {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
        client.close();
    }

    #[test]
    fn api_info_version_parses() {
        let info = Value::Array(vec![
            Value::from(3u64),
            Value::Map(vec![(
                Value::from("version"),
                Value::Map(vec![
                    (Value::from("major"), Value::from(0u64)),
                    (Value::from("minor"), Value::from(9u64)),
                    (Value::from("patch"), Value::from(5u64)),
                ]),
            )]),
        ]);
        let (channel_id, version) = parse_api_info(&info).unwrap();
        assert_eq!(channel_id, 3);
        assert_eq!(version, (0, 9));
        assert!(version >= MIN_VERSION);
    }
}
