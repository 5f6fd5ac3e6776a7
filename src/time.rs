use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the 32-bit timestamps stored in every block header.
///
/// Hosts without a real-time clock use [`Clock::Pseudo`], a counter that is
/// persisted in the image header on unmount and restored on mount, so that
/// recovery's newest-copy comparison stays monotone across mounts. The
/// counter advances by one per observation.
#[derive(Debug, Clone, Copy)]
pub enum Clock {
    System,
    Pseudo(u32),
}

impl Clock {
    pub fn now(&mut self) -> u32 {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0),
            Clock::Pseudo(next) => {
                let t = *next;
                *next = next.wrapping_add(1);
                t
            }
        }
    }

    /// Re-seeds the pseudo counter; no effect on the system clock.
    pub fn restore(&mut self, value: u32) {
        if let Clock::Pseudo(next) = self {
            *next = value;
        }
    }
}
