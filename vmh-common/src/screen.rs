//! Screen synchronization against the guest framebuffer.
//!
//! The harness never matches images itself. A [`ScreenBackend`] resolves a
//! [`Landmark`] (an opaque pattern name) into a [`Region`] when it is
//! visible, and delivers pointer and keyboard input. [`ScreenSync`] layers
//! bounded waits and compound gestures on top of that.

use crate::errors::{HarnessError, HarnessResult};
use crate::poll::Poller;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Name of a visual pattern, e.g. `"TailsGreeter.png"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Landmark(String);

impl Landmark {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Landmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Landmark {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Landmark {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Bounding box in screen coordinates; y grows downwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Region {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + self.w / 2, self.y + self.h / 2)
    }

    /// Point halfway between the bottom-right corner of `self` and the
    /// top-left corner of `below`.
    pub fn midpoint_to(&self, below: &Region) -> (i32, i32) {
        (
            ((self.x + self.w) + below.x) / 2,
            ((self.y + self.h) + below.y) / 2,
        )
    }
}

/// Result of a one-shot lookup. Absence is an expected answer, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Found(Region),
    Absent,
}

impl Presence {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn region(&self) -> Option<Region> {
        match self {
            Self::Found(region) => Some(*region),
            Self::Absent => None,
        }
    }
}

impl From<Option<Region>> for Presence {
    fn from(found: Option<Region>) -> Self {
        found.map_or(Self::Absent, Self::Found)
    }
}

/// What a pointer action aims at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Landmark(Landmark),
    Point { x: i32, y: i32 },
}

impl From<Landmark> for Target {
    fn from(landmark: Landmark) -> Self {
        Self::Landmark(landmark)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Landmark(Landmark::new(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Named keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Enter,
    Tab,
    Escape,
    Backspace,
    Delete,
    Space,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Insert,
    /// Function key F1..=F12.
    F(u8),
}

impl FromStr for Key {
    type Err = HarnessError;

    /// Parse a key name as written in scenarios ("ENTER", "esc", "F10").
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let upper = name.trim().to_ascii_uppercase();
        let key = match upper.as_str() {
            "ENTER" | "RETURN" => Self::Enter,
            "TAB" => Self::Tab,
            "ESC" | "ESCAPE" => Self::Escape,
            "BACKSPACE" => Self::Backspace,
            "DELETE" | "DEL" => Self::Delete,
            "SPACE" => Self::Space,
            "UP" => Self::Up,
            "DOWN" => Self::Down,
            "LEFT" => Self::Left,
            "RIGHT" => Self::Right,
            "HOME" => Self::Home,
            "END" => Self::End,
            "PAGE_UP" | "PAGEUP" => Self::PageUp,
            "PAGE_DOWN" | "PAGEDOWN" => Self::PageDown,
            "INSERT" => Self::Insert,
            other => match other.strip_prefix('F').and_then(|n| n.parse::<u8>().ok()) {
                Some(n @ 1..=12) => Self::F(n),
                _ => return Err(HarnessError::usage(format!("unsupported key '{name}'"))),
            },
        };
        Ok(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F(n) => write!(f, "F{n}"),
            other => write!(f, "{}", format!("{other:?}").to_ascii_uppercase()),
        }
    }
}

/// Modifier keys held while typing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub meta: bool,
}

impl Modifiers {
    pub const NONE: Modifiers = Modifiers {
        ctrl: false,
        alt: false,
        shift: false,
        meta: false,
    };

    pub const CTRL: Modifiers = Modifiers {
        ctrl: true,
        ..Self::NONE
    };

    pub const ALT: Modifiers = Modifiers {
        alt: true,
        ..Self::NONE
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

impl FromStr for Modifiers {
    type Err = HarnessError;

    /// Parse `"ctrl+alt"`-style modifier lists. Empty means none.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut mods = Modifiers::NONE;
        for part in spec.split('+').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => mods.ctrl = true,
                "alt" => mods.alt = true,
                "shift" => mods.shift = true,
                "meta" | "super" | "win" => mods.meta = true,
                _ => return Err(HarnessError::usage(format!("unsupported modifier '{part}'"))),
            }
        }
        Ok(mods)
    }
}

/// Keyboard input: literal text or a single named key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyInput {
    Text(String),
    Key(Key),
}

impl From<Key> for KeyInput {
    fn from(key: Key) -> Self {
        Self::Key(key)
    }
}

impl From<&str> for KeyInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Installer front-end the scenario targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiMode {
    #[default]
    Gui,
    Text,
}

impl UiMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gui => "gui",
            Self::Text => "text",
        }
    }
}

impl fmt::Display for UiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UiMode {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gui" => Ok(Self::Gui),
            "text" => Ok(Self::Text),
            other => Err(HarnessError::usage(format!("unknown UI mode '{other}'"))),
        }
    }
}

/// Installer landmark for a UI mode: `d-i_<mode>_<base>.png`.
pub fn landmark_for(base: &str, mode: UiMode) -> Landmark {
    Landmark(format!("d-i_{}_{}.png", mode.as_str(), base))
}

/// Image matching and input delivery for one framebuffer.
pub trait ScreenBackend: Send + Sync {
    /// Current location of `landmark`, if visible.
    fn find(&self, landmark: &Landmark) -> HarnessResult<Option<Region>>;

    fn click(&self, x: i32, y: i32, button: MouseButton, count: u32) -> HarnessResult<()>;

    fn move_pointer(&self, x: i32, y: i32) -> HarnessResult<()>;

    fn type_input(&self, input: &KeyInput, modifiers: Modifiers) -> HarnessResult<()>;

    /// Framebuffer width and height.
    fn dimensions(&self) -> HarnessResult<(i32, i32)>;
}

/// Bounded waits and gestures over a [`ScreenBackend`].
#[derive(Clone)]
pub struct ScreenSync {
    backend: Arc<dyn ScreenBackend>,
    poller: Poller,
}

impl fmt::Debug for ScreenSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenSync").field("poller", &self.poller).finish_non_exhaustive()
    }
}

impl ScreenSync {
    pub fn new(backend: Arc<dyn ScreenBackend>, poller: Poller) -> Self {
        Self { backend, poller }
    }

    pub fn poller(&self) -> Poller {
        self.poller
    }

    pub fn dimensions(&self) -> HarnessResult<(i32, i32)> {
        self.backend.dimensions()
    }

    /// Look once, without waiting.
    pub fn locate(&self, landmark: &Landmark) -> HarnessResult<Presence> {
        self.backend.find(landmark).map(Presence::from)
    }

    /// Wait for `landmark` to become visible.
    ///
    /// A timeout is [`HarnessError::NotFound`] only when the backend answered
    /// every lookup; otherwise the last backend error is returned.
    pub fn wait_for(&self, landmark: &Landmark, timeout: Duration) -> HarnessResult<Region> {
        let mut found = None;
        let mut backend_error = None;
        let waited = self.poller.wait_until_ok(timeout, &format!("landmark '{landmark}'"), || {
            found = record(&mut backend_error, self.backend.find(landmark)).flatten();
            Ok(found.is_some())
        });
        match (waited, found) {
            (Ok(elapsed), Some(region)) => {
                debug!(landmark = %landmark, elapsed_ms = elapsed.as_millis() as u64, "landmark found");
                Ok(region)
            }
            _ => Err(backend_error.unwrap_or_else(|| HarnessError::NotFound {
                landmark: landmark.to_string(),
                timeout,
            })),
        }
    }

    /// Wait for the first of several landmarks; checked in the given order.
    pub fn wait_for_any(&self, landmarks: &[Landmark], timeout: Duration) -> HarnessResult<(Landmark, Region)> {
        if landmarks.is_empty() {
            return Err(HarnessError::usage("wait_for_any needs at least one landmark"));
        }
        let names = landmarks.iter().map(Landmark::name).collect::<Vec<_>>().join(" | ");
        let mut hit: Option<(Landmark, Region)> = None;
        let mut backend_error = None;
        let waited = self.poller.wait_until_ok(timeout, &format!("any of '{names}'"), || {
            for landmark in landmarks {
                if let Some(region) = record(&mut backend_error, self.backend.find(landmark)).flatten() {
                    hit = Some((landmark.clone(), region));
                    return Ok(true);
                }
            }
            Ok(false)
        });
        match (waited, hit) {
            (Ok(_), Some((landmark, region))) => {
                debug!(landmark = %landmark, "one of several landmarks found");
                Ok((landmark, region))
            }
            _ => Err(backend_error.unwrap_or(HarnessError::NotFound {
                landmark: names,
                timeout,
            })),
        }
    }

    /// Wait for `landmark` to disappear.
    ///
    /// A lookup that fails does not count as "gone".
    pub fn wait_for_vanish(&self, landmark: &Landmark, timeout: Duration) -> HarnessResult<()> {
        let mut backend_error = None;
        let waited = self.poller.wait_until_ok(timeout, &format!("landmark '{landmark}' to vanish"), || {
            Ok(matches!(record(&mut backend_error, self.backend.find(landmark)), Some(None)))
        });
        match waited {
            Ok(_) => Ok(()),
            Err(_) => Err(backend_error.unwrap_or_else(|| HarnessError::StillPresent {
                landmark: landmark.to_string(),
                timeout,
            })),
        }
    }

    fn resolve(&self, target: &Target) -> HarnessResult<(i32, i32)> {
        match target {
            Target::Point { x, y } => Ok((*x, *y)),
            Target::Landmark(landmark) => match self.locate(landmark)? {
                Presence::Found(region) => Ok(region.center()),
                Presence::Absent => Err(HarnessError::NotFound {
                    landmark: landmark.to_string(),
                    timeout: Duration::ZERO,
                }),
            },
        }
    }

    fn click_target(&self, target: &Target, button: MouseButton, count: u32) -> HarnessResult<()> {
        let (x, y) = self.resolve(target)?;
        debug!(?target, x, y, ?button, count, "click");
        self.backend.click(x, y, button, count)
    }

    /// Click a visible landmark (at its center) or a point.
    pub fn click(&self, target: impl Into<Target>) -> HarnessResult<()> {
        self.click_target(&target.into(), MouseButton::Left, 1)
    }

    pub fn double_click(&self, target: impl Into<Target>) -> HarnessResult<()> {
        self.click_target(&target.into(), MouseButton::Left, 2)
    }

    pub fn right_click(&self, target: impl Into<Target>) -> HarnessResult<()> {
        self.click_target(&target.into(), MouseButton::Right, 1)
    }

    pub fn click_point(&self, x: i32, y: i32) -> HarnessResult<()> {
        self.click_target(&Target::Point { x, y }, MouseButton::Left, 1)
    }

    pub fn wait_and_click(&self, landmark: &Landmark, timeout: Duration) -> HarnessResult<Region> {
        let region = self.wait_for(landmark, timeout)?;
        let (x, y) = region.center();
        self.backend.click(x, y, MouseButton::Left, 1)?;
        Ok(region)
    }

    pub fn wait_and_double_click(&self, landmark: &Landmark, timeout: Duration) -> HarnessResult<Region> {
        let region = self.wait_for(landmark, timeout)?;
        let (x, y) = region.center();
        self.backend.click(x, y, MouseButton::Left, 2)?;
        Ok(region)
    }

    /// Right-click between two stacked landmarks.
    ///
    /// `top` must be strictly above `bottom`; anything else is an authoring
    /// mistake and fails with [`HarnessError::Usage`].
    pub fn right_click_between(&self, top: &Landmark, bottom: &Landmark, timeout: Duration) -> HarnessResult<(i32, i32)> {
        let t = self.wait_for(top, timeout)?;
        let b = self.wait_for(bottom, timeout)?;
        if t.y >= b.y {
            return Err(HarnessError::usage(format!(
                "'{top}' (y={}) is not above '{bottom}' (y={})",
                t.y, b.y
            )));
        }
        let (x, y) = t.midpoint_to(&b);
        debug!(top = %top, bottom = %bottom, x, y, "right click between landmarks");
        self.backend.click(x, y, MouseButton::Right, 1)?;
        Ok((x, y))
    }

    /// Open the context menu between `top` and `bottom` and pick `item`.
    ///
    /// The whole gesture is retried until `timeout`; each landmark lookup
    /// inside one attempt is bounded by `step_timeout`.
    pub fn open_context_menu(
        &self,
        top: &Landmark,
        bottom: &Landmark,
        item: &Landmark,
        step_timeout: Duration,
        timeout: Duration,
    ) -> HarnessResult<()> {
        let mut last_error = None;
        let result = self.poller.wait_until(timeout, &format!("context menu item '{item}'"), || {
            let attempt = self
                .right_click_between(top, bottom, step_timeout)
                .and_then(|_| self.hide_cursor())
                .and_then(|_| self.wait_and_click(item, step_timeout));
            match attempt {
                Ok(_) => true,
                Err(err) => {
                    let usage = matches!(err, HarnessError::Usage(_));
                    last_error = Some(err);
                    // layout errors will not fix themselves
                    usage
                }
            }
        });
        match (result, last_error) {
            (Ok(_), Some(err @ HarnessError::Usage(_))) => Err(err),
            (Ok(_), _) => {
                info!(item = %item, "context menu item selected");
                Ok(())
            }
            (Err(_), Some(err)) => Err(err),
            (Err(err), None) => Err(err),
        }
    }

    /// Park the pointer at the right edge so it cannot hide a landmark.
    pub fn hide_cursor(&self) -> HarnessResult<()> {
        let (w, h) = self.backend.dimensions()?;
        self.backend.move_pointer(w - 1, h / 2)
    }

    pub fn type_input(&self, input: impl Into<KeyInput>, modifiers: Modifiers) -> HarnessResult<()> {
        let input = input.into();
        debug!(?input, ?modifiers, "type");
        self.backend.type_input(&input, modifiers)
    }

    pub fn type_text(&self, text: &str) -> HarnessResult<()> {
        self.type_input(text, Modifiers::NONE)
    }

    pub fn press(&self, key: Key) -> HarnessResult<()> {
        self.type_input(key, Modifiers::NONE)
    }

    /// Press `key` until `landmark` shows up.
    ///
    /// At most `max_presses` presses are sent; after that the loop only
    /// keeps looking until `timeout`.
    pub fn press_until(&self, key: Key, landmark: &Landmark, max_presses: u32, timeout: Duration) -> HarnessResult<Region> {
        let mut presses = 0u32;
        let mut found = None;
        let mut backend_error = None;
        let waited = self.poller.wait_until_ok(timeout, &format!("landmark '{landmark}' after pressing {key}"), || {
            found = record(&mut backend_error, self.backend.find(landmark)).flatten();
            if found.is_some() {
                return Ok(true);
            }
            if presses < max_presses
                && record(&mut backend_error, self.backend.type_input(&KeyInput::Key(key), Modifiers::NONE)).is_some()
            {
                presses += 1;
            }
            Ok(false)
        });
        match (waited, found) {
            (Ok(_), Some(region)) => {
                debug!(landmark = %landmark, %key, presses, "landmark reached by key presses");
                Ok(region)
            }
            _ => Err(backend_error.unwrap_or_else(|| HarnessError::NotFound {
                landmark: landmark.to_string(),
                timeout,
            })),
        }
    }
}

/// Keep a failed backend call in `slot` and turn it into `None`.
fn record<T>(slot: &mut Option<HarnessError>, result: HarnessResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(error = %err, "screen backend call failed");
            *slot = Some(err);
            None
        }
    }
}
