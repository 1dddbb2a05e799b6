use std::thread;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, info, warn};

use quadro::editor::Session;
use quadro::input::{KeyNameLookup, PopupMenu, WindowOps};
use quadro::ipc::{self, MsgType};
use quadro::nvim::NvimClient;
use quadro::Result;

const DEFAULT_ROWS: u64 = 40;
const DEFAULT_COLS: u64 = 120;

#[derive(Debug, Default)]
struct Args {
    files: Vec<String>,
    line: Option<i64>,
    column: Option<i64>,
    nvim_path: Option<String>,
    multigrid: bool,
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--nvim" => args.nvim_path = argv.next(),
            "--line" => args.line = argv.next().and_then(|v| v.parse().ok()),
            "--column" => args.column = argv.next().and_then(|v| v.parse().ok()),
            "--multigrid" => args.multigrid = true,
            _ => args.files.push(arg),
        }
    }
    args
}

/// Hand this launch's request to the instance that already owns the
/// coordination port. Returns false when no instance is reachable.
fn forward_to_running_instance(args: &Args) -> bool {
    let mut client = match ipc::Client::connect() {
        Ok(client) => client,
        Err(err) => {
            debug!(%err, "no running instance, starting one");
            return false;
        }
    };
    if !args.files.is_empty() {
        let paths = args.files.iter().map(|f| json!(f)).collect();
        client.call(MsgType::OpenFile, paths);
    }
    if let Some(line) = args.line {
        client.call(MsgType::GotoLine, vec![json!(line)]);
    }
    if let Some(column) = args.column {
        client.call(MsgType::GotoColumn, vec![json!(column)]);
    }
    client.close();
    true
}

/// Stand-ins for the platform layer when running without a window.
struct NullPopup;

impl PopupMenu for NullPopup {
    fn is_visible(&self) -> bool {
        false
    }

    fn mouse_click(&mut self, _right_button: bool, _position: (f64, f64)) -> bool {
        false
    }

    fn mouse_move(&mut self, _position: (f64, f64)) {}

    fn hide(&mut self) {}
}

struct NullWindow;

impl WindowOps for NullWindow {
    fn zoom_in(&mut self) {}

    fn zoom_out(&mut self) {}

    fn toggle_fullscreen(&mut self) {}

    fn raise(&mut self) {}

    fn set_state(&mut self, _state: &str) {}

    fn set_size(&mut self, _width: u32, _height: u32) {}
}

struct NullLookup;

impl KeyNameLookup for NullLookup {
    fn key_name(&self, _key: quadro::input::Key) -> Option<String> {
        None
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quadro=info".into()),
        )
        .init();

    let args = parse_args();
    if forward_to_running_instance(&args) {
        info!("forwarded to the running instance");
        return Ok(());
    }

    let server = match ipc::Server::bind() {
        Ok(server) => Some(server),
        Err(err) => {
            // Lost the bind race or the port is unusable; run standalone.
            warn!(%err, "single-instance coordination unavailable");
            None
        }
    };

    let nvim_path = args.nvim_path.as_deref().unwrap_or("nvim");
    let mut nvim = NvimClient::spawn(nvim_path, &[])?;
    nvim.attach_ui(DEFAULT_ROWS, DEFAULT_COLS, args.multigrid)?;

    for file in &args.files {
        nvim.open_file(file);
    }
    if let Some(line) = args.line {
        nvim.goto_line(line);
    }
    if let Some(column) = args.column {
        nvim.goto_column(column);
    }

    let mut session = Session::new(
        nvim,
        server,
        Box::new(NullPopup),
        Box::new(NullWindow),
        Box::new(NullLookup),
    );

    info!("session started");
    while !session.should_exit() {
        let started = Instant::now();
        if session.tick() {
            // Without a surface attached there is nothing to upload; the
            // windowed front-end rebuilds geometry here instead.
            session.grids.clear_dirty();
        }
        let interval = session.tick_interval();
        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }

    session.shutdown();
    Ok(())
}
