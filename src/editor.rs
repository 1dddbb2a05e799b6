//! The per-process session: one backend client, the grid state it draws
//! into, the runtime options, and the optional single-instance server.
//! Everything is owned here; nothing lives in globals.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::grid::GridSet;
use crate::input::{
    Action, Bindings, InputCtx, InputEncoder, InputSink, Key, KeyNameLookup, MouseButton,
    PopupMenu, WindowOps,
};
use crate::ipc::{self, MsgType, RemoteCall};
use crate::nvim::{NvimClient, OptionChange};

impl InputSink for NvimClient {
    fn input(&self, keys: &str) {
        NvimClient::input(self, keys);
    }

    fn input_mouse(
        &self,
        button: &str,
        action: &str,
        modifiers: &str,
        grid: i64,
        row: i64,
        col: i64,
    ) {
        NvimClient::input_mouse(self, button, action, modifiers, grid, row, col);
    }

    fn open_file(&self, path: &str) {
        NvimClient::open_file(self, path);
    }
}

/// Editing operations a forwarded request from another launch can invoke.
pub trait RemoteTarget {
    fn open_file(&self, path: &str);
    fn goto_line(&self, line: i64);
    fn goto_column(&self, col: i64);
}

impl RemoteTarget for NvimClient {
    fn open_file(&self, path: &str) {
        NvimClient::open_file(self, path);
    }

    fn goto_line(&self, line: i64) {
        NvimClient::goto_line(self, line);
    }

    fn goto_column(&self, col: i64) {
        NvimClient::goto_column(self, col);
    }
}

/// Runtime options, pushed from the backend through the registered user
/// command. Values arrive as strings and are validated here; a bad value is
/// logged and the previous one stays.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub cursor_anim_time: f32,
    pub transparency: f32,
    pub target_tps: u32,
    pub context_menu_enabled: bool,
    pub key_fullscreen: String,
    pub key_zoom_in: String,
    pub key_zoom_out: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cursor_anim_time: 0.1,
            transparency: 1.0,
            target_tps: 60,
            context_menu_enabled: true,
            key_fullscreen: "<F11>".into(),
            key_zoom_in: "<C-kPlus>".into(),
            key_zoom_out: "<C-kMinus>".into(),
        }
    }
}

impl Options {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_tps.max(1)))
    }

    pub fn bindings(&self) -> Bindings {
        Bindings {
            zoom_in: self.key_zoom_in.clone(),
            zoom_out: self.key_zoom_out.clone(),
            toggle_fullscreen: self.key_fullscreen.clone(),
        }
    }

    /// Apply one pushed change. Changes drained in the same tick are applied
    /// in arrival order, so a later entry for the same name wins. Window
    /// state and size act on the window immediately instead of being stored.
    pub fn apply(&mut self, change: &OptionChange, window: &mut dyn WindowOps) {
        let value = change.value.as_str();
        match change.name.as_str() {
            "CursorAnimTime" => match value.parse::<f32>() {
                Ok(time) if time >= 0.0 => self.cursor_anim_time = time,
                _ => warn!(value, "invalid CursorAnimTime, keeping previous"),
            },
            "Transparency" => match value.parse::<f32>() {
                Ok(alpha) if (0.0..=1.0).contains(&alpha) => self.transparency = alpha,
                _ => warn!(value, "invalid Transparency, keeping previous"),
            },
            "TargetTPS" => match value.parse::<u32>() {
                Ok(tps) if tps > 0 => self.target_tps = tps,
                _ => warn!(value, "invalid TargetTPS, keeping previous"),
            },
            "ContextMenuOn" => match parse_bool(value) {
                Some(enabled) => self.context_menu_enabled = enabled,
                None => warn!(value, "invalid ContextMenuOn, keeping previous"),
            },
            "KeyFullscreen" => self.key_fullscreen = change.value.clone(),
            "KeyZoomIn" => self.key_zoom_in = change.value.clone(),
            "KeyZoomOut" => self.key_zoom_out = change.value.clone(),
            "WindowState" => window.set_state(value),
            "WindowSize" => match parse_size(value) {
                Some((width, height)) => window.set_size(width, height),
                None => warn!(value, "invalid WindowSize, expected WIDTHxHEIGHT"),
            },
            other => warn!(name = other, "unknown option"),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "True" | "TRUE" | "1" => Some(true),
        "false" | "False" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}

fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (width, height) = value.split_once('x')?;
    Some((width.parse().ok()?, height.parse().ok()?))
}

/// Hand drained coordination calls to the editing backend. The window is
/// raised afterwards so the running instance surfaces over the one that
/// forwarded the request.
pub fn dispatch_remote_calls(
    calls: &[RemoteCall],
    target: &dyn RemoteTarget,
    window: &mut dyn WindowOps,
) {
    if calls.is_empty() {
        return;
    }
    for call in calls {
        match call.msg_type {
            MsgType::OpenFile => {
                for path in call.args.iter().filter_map(|arg| arg.as_str()) {
                    info!(path, "opening file for another launch");
                    target.open_file(path);
                }
            }
            MsgType::GotoLine => {
                if let Some(line) = call.args.first().and_then(|arg| arg.as_i64()) {
                    target.goto_line(line);
                }
            }
            MsgType::GotoColumn => {
                if let Some(col) = call.args.first().and_then(|arg| arg.as_i64()) {
                    target.goto_column(col);
                }
            }
            // The server queues every non-CLOSE message, so a peer using
            // OK as a request lands here.
            MsgType::Ok => warn!("ignoring invalid forwarded signal"),
            // Close ends the connection reader and is never queued.
            MsgType::Close => {}
        }
    }
    window.raise();
}

pub struct Session {
    nvim: NvimClient,
    pub grids: GridSet,
    pub options: Options,
    server: Option<ipc::Server>,
    encoder: InputEncoder,
    popup: Box<dyn PopupMenu>,
    window: Box<dyn WindowOps>,
    lookup: Box<dyn KeyNameLookup>,
}

impl Session {
    pub fn new(
        nvim: NvimClient,
        server: Option<ipc::Server>,
        popup: Box<dyn PopupMenu>,
        window: Box<dyn WindowOps>,
        lookup: Box<dyn KeyNameLookup>,
    ) -> Self {
        let options = Options::default();
        let mut encoder = InputEncoder::new();
        encoder.bindings = options.bindings();
        encoder.popup_enabled = options.context_menu_enabled;
        Self {
            nvim,
            grids: GridSet::new(),
            options,
            server,
            encoder,
            popup,
            window,
            lookup,
        }
    }

    pub fn nvim(&self) -> &NvimClient {
        &self.nvim
    }

    pub fn tick_interval(&self) -> Duration {
        self.options.tick_interval()
    }

    pub fn set_cell_size(&mut self, width: f64, height: f64) {
        self.encoder.set_cell_size(width, height);
    }

    /// One scheduler tick: apply pushed option changes, fold queued redraw
    /// batches into the grids, then serve forwarded requests from other
    /// launches. Returns whether the grids changed so the caller knows to
    /// rebuild and upload geometry.
    pub fn tick(&mut self) -> bool {
        let changes = self.nvim.drain_options();
        if !changes.is_empty() {
            for change in &changes {
                self.options.apply(change, self.window.as_mut());
            }
            self.encoder.bindings = self.options.bindings();
            self.encoder.popup_enabled = self.options.context_menu_enabled;
        }

        for batch in self.nvim.drain_redraw() {
            self.grids.apply(&batch);
        }

        if let Some(server) = &self.server {
            dispatch_remote_calls(&server.drain(), &self.nvim, self.window.as_mut());
        }

        self.grids.any_dirty()
    }

    pub fn should_exit(&self) -> bool {
        self.nvim.exited()
    }

    /// Ordered teardown: stop serving other launches first, then shut the
    /// backend down. GPU resources are the caller's and drop by scope.
    pub fn shutdown(&mut self) {
        if let Some(server) = self.server.take() {
            server.close();
        }
        self.nvim.close();
        debug!("session closed");
    }

    fn ctx<'a>(
        nvim: &'a NvimClient,
        lookup: &'a dyn KeyNameLookup,
        popup: &'a mut dyn PopupMenu,
        window: &'a mut dyn WindowOps,
    ) -> InputCtx<'a> {
        InputCtx {
            sink: nvim,
            lookup,
            popup,
            window,
        }
    }

    pub fn on_key(&mut self, key: Key, action: Action) {
        let mut ctx = Self::ctx(
            &self.nvim,
            self.lookup.as_ref(),
            self.popup.as_mut(),
            self.window.as_mut(),
        );
        self.encoder.handle_key(key, action, &mut ctx);
    }

    pub fn on_char(&mut self, ch: char) {
        let mut ctx = Self::ctx(
            &self.nvim,
            self.lookup.as_ref(),
            self.popup.as_mut(),
            self.window.as_mut(),
        );
        self.encoder.handle_char(ch, &mut ctx);
    }

    pub fn on_mouse_button(&mut self, button: MouseButton, action: Action) {
        let mut ctx = Self::ctx(
            &self.nvim,
            self.lookup.as_ref(),
            self.popup.as_mut(),
            self.window.as_mut(),
        );
        self.encoder.handle_mouse_button(button, action, &mut ctx);
    }

    pub fn on_mouse_move(&mut self, x: f64, y: f64) {
        let mut ctx = Self::ctx(
            &self.nvim,
            self.lookup.as_ref(),
            self.popup.as_mut(),
            self.window.as_mut(),
        );
        self.encoder.handle_mouse_move(x, y, &mut ctx);
    }

    pub fn on_scroll(&mut self, x_offset: f64, y_offset: f64) {
        let mut ctx = Self::ctx(
            &self.nvim,
            self.lookup.as_ref(),
            self.popup.as_mut(),
            self.window.as_mut(),
        );
        self.encoder.handle_scroll(x_offset, y_offset, &mut ctx);
    }

    pub fn on_file_drop(&mut self, paths: &[String]) {
        let mut ctx = Self::ctx(
            &self.nvim,
            self.lookup.as_ref(),
            self.popup.as_mut(),
            self.window.as_mut(),
        );
        self.encoder.handle_drop(paths, &mut ctx);
    }

    pub fn resize_grid(&self, rows: i64, cols: i64) {
        self.nvim.try_resize_ui(rows, cols);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::test_support::FakeWindow;
    use serde_json::json;
    use std::cell::RefCell;

    fn change(name: &str, value: &str) -> OptionChange {
        OptionChange {
            name: name.into(),
            value: value.into(),
        }
    }

    #[test]
    fn later_change_for_the_same_name_wins() {
        let mut options = Options::default();
        let mut window = FakeWindow::default();
        for c in [change("TargetTPS", "30"), change("TargetTPS", "120")] {
            options.apply(&c, &mut window);
        }
        assert_eq!(options.target_tps, 120);
        assert_eq!(options.tick_interval(), Duration::from_secs_f64(1.0 / 120.0));
    }

    #[test]
    fn invalid_values_keep_the_previous_setting() {
        let mut options = Options::default();
        let mut window = FakeWindow::default();
        options.apply(&change("TargetTPS", "fast"), &mut window);
        options.apply(&change("TargetTPS", "0"), &mut window);
        options.apply(&change("Transparency", "1.5"), &mut window);
        options.apply(&change("CursorAnimTime", "-1"), &mut window);
        assert_eq!(options, Options::default());
    }

    #[test]
    fn window_options_act_on_the_window_immediately() {
        let mut options = Options::default();
        let mut window = FakeWindow::default();
        options.apply(&change("WindowState", "maximized"), &mut window);
        options.apply(&change("WindowSize", "800x600"), &mut window);
        options.apply(&change("WindowSize", "800by600"), &mut window);
        assert_eq!(window.state.as_deref(), Some("maximized"));
        assert_eq!(window.size, Some((800, 600)));
    }

    #[test]
    fn boolean_and_binding_options_parse() {
        let mut options = Options::default();
        let mut window = FakeWindow::default();
        options.apply(&change("ContextMenuOn", "false"), &mut window);
        options.apply(&change("KeyZoomIn", "<C-=>"), &mut window);
        assert!(!options.context_menu_enabled);
        assert_eq!(options.bindings().zoom_in, "<C-=>");
    }

    #[derive(Default)]
    struct RecordingTarget {
        log: RefCell<Vec<String>>,
    }

    impl RemoteTarget for RecordingTarget {
        fn open_file(&self, path: &str) {
            self.log.borrow_mut().push(format!("open {path}"));
        }

        fn goto_line(&self, line: i64) {
            self.log.borrow_mut().push(format!("line {line}"));
        }

        fn goto_column(&self, col: i64) {
            self.log.borrow_mut().push(format!("col {col}"));
        }
    }

    #[test]
    fn remote_calls_dispatch_in_order_and_raise_once() {
        let target = RecordingTarget::default();
        let mut window = FakeWindow::default();
        let calls = vec![
            RemoteCall {
                msg_type: MsgType::OpenFile,
                machine_id: 1,
                args: vec![json!("a.txt"), json!("b.txt")],
            },
            RemoteCall {
                msg_type: MsgType::GotoLine,
                machine_id: 1,
                args: vec![json!(12)],
            },
            RemoteCall {
                msg_type: MsgType::GotoColumn,
                machine_id: 1,
                args: vec![json!(3)],
            },
        ];
        dispatch_remote_calls(&calls, &target, &mut window);
        assert_eq!(
            *target.log.borrow(),
            vec!["open a.txt", "open b.txt", "line 12", "col 3"]
        );
        assert_eq!(window.raised, 1);
    }

    #[test]
    fn stray_ok_signal_dispatches_nothing() {
        let target = RecordingTarget::default();
        let mut window = FakeWindow::default();
        let calls = vec![RemoteCall {
            msg_type: MsgType::Ok,
            machine_id: 1,
            args: vec![],
        }];
        dispatch_remote_calls(&calls, &target, &mut window);
        assert!(target.log.borrow().is_empty());
    }

    #[test]
    fn empty_drain_does_not_raise_the_window() {
        let target = RecordingTarget::default();
        let mut window = FakeWindow::default();
        dispatch_remote_calls(&[], &target, &mut window);
        assert_eq!(window.raised, 0);
    }
}
