//! Translates raw window input into the backend's key token vocabulary and
//! mouse calls.
//!
//! Key tokens are `<` + modifier prefixes in the fixed order Control,
//! Shift, Alt, Super + key name + `>`. A handful of tokens are intercepted
//! locally (zoom, fullscreen, popup-menu escape) and consume the event
//! instead of being forwarded.

use bitflags::bitflags;
use tracing::trace;

bitflags! {
    /// Logical modifier set: left/right physical variants alias into one
    /// flag each.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Modifiers: u8 {
        const CONTROL = 1 << 0;
        const SHIFT = 1 << 1;
        const ALT = 1 << 2;
        const SUPER = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Press,
    Repeat,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    fn code(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

/// Physical key identity as delivered by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
    Enter,
    KpEnter,
    Space,
    Backspace,
    Up,
    Down,
    Right,
    Left,
    Tab,
    Insert,
    Delete,
    Home,
    End,
    PageUp,
    PageDown,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    ControlLeft,
    ControlRight,
    ShiftLeft,
    ShiftRight,
    AltLeft,
    AltRight,
    SuperLeft,
    SuperRight,
    /// Everything else; resolvable only through the platform name lookup.
    Other(u32),
}

/// Fixed named-key table. Keys absent here are only representable through
/// the platform lookup (and then only with Control alone).
fn named_key(key: Key) -> Option<&'static str> {
    Some(match key {
        Key::Escape => "ESC",
        Key::Enter => "CR",
        Key::KpEnter => "kEnter",
        Key::Space => "Space",
        Key::Backspace => "BS",
        Key::Up => "Up",
        Key::Down => "Down",
        Key::Right => "Right",
        Key::Left => "Left",
        Key::Tab => "Tab",
        Key::Insert => "Insert",
        Key::Delete => "Del",
        Key::Home => "Home",
        Key::End => "End",
        Key::PageUp => "PageUp",
        Key::PageDown => "PageDown",
        Key::F1 => "F1",
        Key::F2 => "F2",
        Key::F3 => "F3",
        Key::F4 => "F4",
        Key::F5 => "F5",
        Key::F6 => "F6",
        Key::F7 => "F7",
        Key::F8 => "F8",
        Key::F9 => "F9",
        Key::F10 => "F10",
        Key::F11 => "F11",
        Key::F12 => "F12",
        _ => return None,
    })
}

fn modifier_flag(key: Key) -> Option<Modifiers> {
    Some(match key {
        Key::ControlLeft | Key::ControlRight => Modifiers::CONTROL,
        Key::ShiftLeft | Key::ShiftRight => Modifiers::SHIFT,
        Key::AltLeft | Key::AltRight => Modifiers::ALT,
        Key::SuperLeft | Key::SuperRight => Modifiers::SUPER,
        _ => return None,
    })
}

/// Where encoded events go. The live implementation is the backend client;
/// tests substitute a recorder.
pub trait InputSink {
    fn input(&self, keys: &str);
    fn input_mouse(&self, button: &str, action: &str, modifiers: &str, grid: i64, row: i64, col: i64);
    fn open_file(&self, path: &str);
}

/// Platform keyboard-layout name lookup for keys outside the named table.
pub trait KeyNameLookup {
    fn key_name(&self, key: Key) -> Option<String>;
}

/// The right-click/context menu widget. Layout and hit-testing live
/// elsewhere; the encoder only needs the consume/ignore decision.
pub trait PopupMenu {
    fn is_visible(&self) -> bool;
    /// Returns true when the click was consumed by the menu.
    fn mouse_click(&mut self, right_button: bool, position: (f64, f64)) -> bool;
    fn mouse_move(&mut self, position: (f64, f64));
    fn hide(&mut self);
}

/// Window-level actions bound to intercepted tokens.
pub trait WindowOps {
    fn zoom_in(&mut self);
    fn zoom_out(&mut self);
    fn toggle_fullscreen(&mut self);
    fn raise(&mut self);
    fn set_state(&mut self, state: &str);
    fn set_size(&mut self, width: u32, height: u32);
}

/// Collaborators threaded through each event, owned by the session.
pub struct InputCtx<'a> {
    pub sink: &'a dyn InputSink,
    pub lookup: &'a dyn KeyNameLookup,
    pub popup: &'a mut dyn PopupMenu,
    pub window: &'a mut dyn WindowOps,
}

/// Tokens intercepted before forwarding.
#[derive(Debug, Clone)]
pub struct Bindings {
    pub zoom_in: String,
    pub zoom_out: String,
    pub toggle_fullscreen: String,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            zoom_in: "<C-kPlus>".into(),
            zoom_out: "<C-kMinus>".into(),
            toggle_fullscreen: "<F11>".into(),
        }
    }
}

pub struct InputEncoder {
    mods: Modifiers,
    pub bindings: Bindings,
    pub popup_enabled: bool,
    cell_size: (f64, f64),
    last_mouse_position: (f64, f64),
    held_button: Option<MouseButton>,
}

impl Default for InputEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl InputEncoder {
    pub fn new() -> Self {
        Self {
            mods: Modifiers::empty(),
            bindings: Bindings::default(),
            popup_enabled: true,
            cell_size: (8.0, 16.0),
            last_mouse_position: (0.0, 0.0),
            held_button: None,
        }
    }

    pub fn set_cell_size(&mut self, width: f64, height: f64) {
        if width > 0.0 && height > 0.0 {
            self.cell_size = (width, height);
        }
    }

    pub fn modifiers(&self) -> Modifiers {
        self.mods
    }

    /// Grid-relative cell under the last known pointer position.
    fn mouse_cell(&self) -> (i64, i64) {
        let row = (self.last_mouse_position.1 / self.cell_size.1) as i64;
        let col = (self.last_mouse_position.0 / self.cell_size.0) as i64;
        (row, col)
    }

    /// Single-letter markers in the fixed Control, Shift, Alt, Super order.
    fn modifier_string(&self) -> String {
        let mut out = String::new();
        if self.mods.contains(Modifiers::CONTROL) {
            out.push('C');
        }
        if self.mods.contains(Modifiers::SHIFT) {
            out.push('S');
        }
        if self.mods.contains(Modifiers::ALT) {
            out.push('A');
        }
        if self.mods.contains(Modifiers::SUPER) {
            out.push('D');
        }
        out
    }

    fn build_token(&self, name: &str) -> String {
        let mut token = String::from("<");
        if self.mods.contains(Modifiers::CONTROL) {
            token.push_str("C-");
        }
        if self.mods.contains(Modifiers::SHIFT) {
            token.push_str("S-");
        }
        if self.mods.contains(Modifiers::ALT) {
            token.push_str("A-");
        }
        if self.mods.contains(Modifiers::SUPER) {
            token.push_str("D-");
        }
        token.push_str(name);
        token.push('>');
        token
    }

    pub fn handle_key(&mut self, key: Key, action: Action, ctx: &mut InputCtx<'_>) {
        if let Some(flag) = modifier_flag(key) {
            match action {
                Action::Press | Action::Repeat => self.mods.insert(flag),
                Action::Release => self.mods.remove(flag),
            }
            return;
        }
        if action == Action::Release {
            return;
        }

        let name = match named_key(key) {
            Some(name) => name.to_string(),
            None => {
                if self.mods.intersects(Modifiers::SHIFT | Modifiers::ALT | Modifiers::SUPER) {
                    // No unambiguous token exists; the paired character
                    // event carries the text instead.
                    return;
                }
                if !self.mods.contains(Modifiers::CONTROL) {
                    return;
                }
                match ctx.lookup.key_name(key) {
                    Some(name) => name,
                    None => return,
                }
            }
        };

        let token = self.build_token(&name);
        if token == self.bindings.zoom_in {
            ctx.window.zoom_in();
            return;
        }
        if token == self.bindings.zoom_out {
            ctx.window.zoom_out();
            return;
        }
        if token == self.bindings.toggle_fullscreen {
            ctx.window.toggle_fullscreen();
            return;
        }
        if token == "<ESC>" && self.popup_enabled && ctx.popup.is_visible() {
            ctx.popup.hide();
            return;
        }

        ctx.sink.input(&token);
    }

    /// Literal text input. Space arrives through the key path instead and
    /// `<` must be escaped to keep it out of the token syntax.
    pub fn handle_char(&mut self, ch: char, ctx: &mut InputCtx<'_>) {
        match ch {
            ' ' => {}
            '<' => ctx.sink.input("<LT>"),
            _ => {
                let mut buf = [0u8; 4];
                ctx.sink.input(ch.encode_utf8(&mut buf));
            }
        }
    }

    pub fn handle_mouse_button(
        &mut self,
        button: MouseButton,
        action: Action,
        ctx: &mut InputCtx<'_>,
    ) {
        match button {
            MouseButton::Left => {
                if action == Action::Press
                    && self.popup_enabled
                    && ctx.popup.mouse_click(false, self.last_mouse_position)
                {
                    return;
                }
            }
            MouseButton::Right => {
                if action == Action::Press && self.popup_enabled {
                    // The menu owns right-click entirely when enabled.
                    ctx.popup.mouse_click(true, self.last_mouse_position);
                    return;
                }
            }
            MouseButton::Middle => {}
        }

        let action_code = match action {
            Action::Press | Action::Repeat => "press",
            Action::Release => "release",
        };
        let (row, col) = self.mouse_cell();
        ctx.sink
            .input_mouse(button.code(), action_code, &self.modifier_string(), 0, row, col);

        self.held_button = match action {
            Action::Press | Action::Repeat => Some(button),
            Action::Release => None,
        };
    }

    pub fn handle_mouse_move(&mut self, x: f64, y: f64, ctx: &mut InputCtx<'_>) {
        self.last_mouse_position = (x, y);
        if self.popup_enabled {
            ctx.popup.mouse_move((x, y));
        }
        // Motion with a button held down is a drag for that button.
        if let Some(button) = self.held_button {
            let (row, col) = self.mouse_cell();
            ctx.sink
                .input_mouse(button.code(), "drag", &self.modifier_string(), 0, row, col);
        }
    }

    /// Wheel events are synthesized from the vertical offset: strictly
    /// negative scrolls down, everything else (zero included) scrolls up.
    pub fn handle_scroll(&mut self, _x_offset: f64, y_offset: f64, ctx: &mut InputCtx<'_>) {
        let action = if y_offset < 0.0 { "down" } else { "up" };
        let (row, col) = self.mouse_cell();
        ctx.sink
            .input_mouse("wheel", action, &self.modifier_string(), 0, row, col);
    }

    /// Dropped paths open in drop order.
    pub fn handle_drop(&mut self, paths: &[String], ctx: &mut InputCtx<'_>) {
        for path in paths {
            trace!(path, "opening dropped file");
            ctx.sink.open_file(path);
        }
    }
}
