//! Remote playback control.
//!
//! Players are attached to the router as capabilities; the router never
//! sees a window or decoder, only this trait.

use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Playback actions a remote client may trigger.
///
/// Only `play_pause` has an HTTP route; `seek` and `set_position_fraction`
/// are for embedders driving the player directly.
pub trait PlayerControl: Send + Sync {
    fn play_pause(&self);
    /// Jump to an absolute position.
    fn seek(&self, position: Duration);
    /// Jump to a fraction `0.0..=1.0` of the media duration.
    fn set_position_fraction(&self, fraction: f64);
}

/// Players currently attached to a router.
#[derive(Default)]
pub struct PlayerSet {
    players: RwLock<Vec<Arc<dyn PlayerControl>>>,
}

impl PlayerSet {
    pub fn attach(&self, player: Arc<dyn PlayerControl>) {
        self.players
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(player);
    }

    /// Detach by identity. Returns whether the player was attached.
    pub fn detach(&self, player: &Arc<dyn PlayerControl>) -> bool {
        let mut players = self.players.write().unwrap_or_else(|e| e.into_inner());
        let before = players.len();
        players.retain(|p| !Arc::ptr_eq(p, player));
        players.len() != before
    }

    pub fn len(&self) -> usize {
        self.players.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `action` on a snapshot of the attached players.
    pub fn for_each(&self, action: impl Fn(&dyn PlayerControl)) {
        let snapshot = self.players.read().unwrap_or_else(|e| e.into_inner()).clone();
        for player in &snapshot {
            action(player.as_ref());
        }
    }
}

/// Page served at `/control`.
pub const CONTROL_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Playback control</title>
<style>
  body { font-family: sans-serif; display: flex; height: 100vh; margin: 0;
         align-items: center; justify-content: center; background: #111; }
  button { font-size: 2rem; padding: 1rem 3rem; border-radius: 0.5rem; }
</style>
</head>
<body>
<button id="playpause">Play / Pause</button>
<script>
  document.getElementById("playpause").addEventListener("click", function () {
    fetch("/control/playpause", { method: "POST" });
  });
</script>
</body>
</html>
"#;
