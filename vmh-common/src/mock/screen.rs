//! Scripted framebuffer: landmarks appear and vanish on a timer or in
//! reaction to input, and every input event is recorded.

use crate::errors::HarnessResult;
use crate::screen::{Key, KeyInput, Landmark, Modifiers, MouseButton, Region, ScreenBackend};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Input delivered to a [`MockScreen`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Click { x: i32, y: i32, button: MouseButton, count: u32 },
    Move { x: i32, y: i32 },
    Type { input: KeyInput, modifiers: Modifiers },
}

#[derive(Debug, Clone, Copy)]
struct Shown {
    region: Region,
    from: Instant,
    until: Option<Instant>,
}

impl Shown {
    fn visible(&self, now: Instant) -> bool {
        now >= self.from && self.until.is_none_or(|until| now < until)
    }
}

#[derive(Debug, Clone)]
enum Trigger {
    Key(Key),
    Text(String),
    RightClick,
}

#[derive(Debug, Default)]
struct State {
    landmarks: HashMap<String, Shown>,
    reactions: Vec<(Trigger, String, Region)>,
    hide_on_click: Vec<String>,
    events: Vec<InputEvent>,
}

impl State {
    fn reveal(&mut self, name: &str, region: Region) {
        self.landmarks.insert(
            name.to_string(),
            Shown {
                region,
                from: Instant::now(),
                until: None,
            },
        );
    }

    fn react(&mut self, fired: impl Fn(&Trigger) -> bool) {
        let hits: Vec<(String, Region)> = self
            .reactions
            .iter()
            .filter(|(trigger, _, _)| fired(trigger))
            .map(|(_, name, region)| (name.clone(), *region))
            .collect();
        for (name, region) in hits {
            self.reveal(&name, region);
        }
    }
}

#[derive(Debug)]
pub struct MockScreen {
    width: i32,
    height: i32,
    state: Mutex<State>,
}

impl MockScreen {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn show(&self, name: &str, region: Region) {
        self.lock().reveal(name, region);
    }

    pub fn show_after(&self, name: &str, region: Region, delay: Duration) {
        self.lock().landmarks.insert(
            name.to_string(),
            Shown {
                region,
                from: Instant::now() + delay,
                until: None,
            },
        );
    }

    pub fn hide(&self, name: &str) {
        self.lock().landmarks.remove(name);
    }

    pub fn hide_after(&self, name: &str, delay: Duration) {
        if let Some(shown) = self.lock().landmarks.get_mut(name) {
            shown.until = Some(Instant::now() + delay);
        }
    }

    /// Show `name` as soon as `key` is pressed.
    pub fn reveal_on_key(&self, key: Key, name: &str, region: Region) {
        self.lock().reactions.push((Trigger::Key(key), name.to_string(), region));
    }

    /// Show `name` once `text` has been typed.
    pub fn reveal_on_text(&self, text: &str, name: &str, region: Region) {
        self.lock()
            .reactions
            .push((Trigger::Text(text.to_string()), name.to_string(), region));
    }

    pub fn reveal_on_right_click(&self, name: &str, region: Region) {
        self.lock().reactions.push((Trigger::RightClick, name.to_string(), region));
    }

    /// Hide `name` when a left click lands inside it.
    pub fn hide_on_click(&self, name: &str) {
        self.lock().hide_on_click.push(name.to_string());
    }

    pub fn is_visible(&self, name: &str) -> bool {
        self.lock()
            .landmarks
            .get(name)
            .is_some_and(|shown| shown.visible(Instant::now()))
    }

    pub fn events(&self) -> Vec<InputEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Everything typed as text, concatenated.
    pub fn typed_text(&self) -> String {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                InputEvent::Type {
                    input: KeyInput::Text(text),
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

fn contains(region: &Region, x: i32, y: i32) -> bool {
    x >= region.x && x < region.x + region.w && y >= region.y && y < region.y + region.h
}

impl ScreenBackend for MockScreen {
    fn find(&self, landmark: &Landmark) -> HarnessResult<Option<Region>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .landmarks
            .get(landmark.name())
            .filter(|shown| shown.visible(now))
            .map(|shown| shown.region))
    }

    fn click(&self, x: i32, y: i32, button: MouseButton, count: u32) -> HarnessResult<()> {
        let mut state = self.lock();
        state.events.push(InputEvent::Click { x, y, button, count });
        match button {
            MouseButton::Right => state.react(|t| matches!(t, Trigger::RightClick)),
            MouseButton::Left => {
                let now = Instant::now();
                let hidden: Vec<String> = state
                    .hide_on_click
                    .iter()
                    .filter(|name| {
                        state
                            .landmarks
                            .get(name.as_str())
                            .is_some_and(|s| s.visible(now) && contains(&s.region, x, y))
                    })
                    .cloned()
                    .collect();
                for name in hidden {
                    state.landmarks.remove(&name);
                }
            }
            MouseButton::Middle => {}
        }
        Ok(())
    }

    fn move_pointer(&self, x: i32, y: i32) -> HarnessResult<()> {
        self.lock().events.push(InputEvent::Move { x, y });
        Ok(())
    }

    fn type_input(&self, input: &KeyInput, modifiers: Modifiers) -> HarnessResult<()> {
        let mut state = self.lock();
        state.events.push(InputEvent::Type {
            input: input.clone(),
            modifiers,
        });
        match input {
            KeyInput::Key(key) => state.react(|t| matches!(t, Trigger::Key(k) if k == key)),
            KeyInput::Text(text) => state.react(|t| matches!(t, Trigger::Text(s) if s == text)),
        }
        Ok(())
    }

    fn dimensions(&self) -> HarnessResult<(i32, i32)> {
        Ok((self.width, self.height))
    }
}
