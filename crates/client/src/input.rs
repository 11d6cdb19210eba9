/// Source of per-player actions: `(x, y)` with both axes in [−1, 1].
/// Negative y is jump intent, positive y brakes the roll. The real
/// frontend plugs a keyboard in here; headless runs use [`NullInput`].
pub trait InputSource {
    fn action(&mut self, player: usize) -> (f32, f32);
}

/// No input at all; the player coasts.
pub struct NullInput;

impl InputSource for NullInput {
    fn action(&mut self, _player: usize) -> (f32, f32) {
        (0.0, 0.0)
    }
}
