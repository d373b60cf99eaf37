/// Counts consecutive pings that went unanswered.
#[derive(Debug, Clone)]
pub struct PingTracker {
    max_missed: u32,
    missed: u32,
    awaiting_pong: bool,
}

impl PingTracker {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed,
            missed: 0,
            awaiting_pong: false,
        }
    }

    pub fn ping_sent(&mut self) {
        self.awaiting_pong = true;
    }

    pub fn pong_received(&mut self) {
        self.awaiting_pong = false;
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Called once the pong deadline of the last ping has passed.
    /// Returns true when the peer has to be disconnected.
    pub fn deadline_passed(&mut self) -> bool {
        if self.awaiting_pong {
            self.awaiting_pong = false;
            self.missed += 1;
        }
        self.missed >= self.max_missed
    }
}
