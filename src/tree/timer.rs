use std::time::{Duration, Instant};

use crate::config::TportConfig;

/// What an expired secondary timer asks for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimerAction {
    SendPing,
    PongTimeout,
    IdleTimeout,
    IncompleteTimeout,
}

/// Timer settings of one secondary, adjustable while it runs.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct TimerParams {
    pub idle: Option<Duration>,
    pub incomplete_timeout: Option<Duration>,
    pub keepalive: Option<Duration>,
    pub pingpong: Option<Duration>,
    pub pong2ping: bool,
}

impl TimerParams {
    pub fn set_idle(mut self, idle: Option<Duration>) -> Self {
        self.idle = idle;
        self
    }
    pub fn set_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }
    pub fn set_pingpong(mut self, pingpong: Option<Duration>) -> Self {
        self.pingpong = pingpong;
        self
    }
    pub fn set_pong2ping(mut self, pong2ping: bool) -> Self {
        self.pong2ping = pong2ping;
        self
    }
    pub fn set_incomplete_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.incomplete_timeout = timeout;
        self
    }
}

impl From<&TportConfig> for TimerParams {
    fn from(config: &TportConfig) -> Self {
        Self {
            idle: config.idle,
            incomplete_timeout: config.incomplete_timeout,
            keepalive: config.keepalive,
            pingpong: config.pingpong,
            pong2ping: config.pong2ping,
        }
    }
}

/// Deadlines of one secondary. Pure bookkeeping; the owner sleeps until
/// [`SecondaryTimers::next_deadline`] and then asks what expired.
#[derive(Debug)]
pub struct SecondaryTimers {
    params: TimerParams,
    last_activity: Instant,
    next_ping: Option<Instant>,
    awaiting_pong: Option<Instant>,
    incomplete_since: Option<Instant>,
}

impl SecondaryTimers {
    pub fn new(params: TimerParams, now: Instant) -> Self {
        Self {
            params,
            last_activity: now,
            next_ping: params.keepalive.map(|k| now + k),
            awaiting_pong: None,
            incomplete_since: None,
        }
    }

    pub fn params(&self) -> &TimerParams {
        &self.params
    }

    pub fn update(&mut self, params: TimerParams, now: Instant) {
        if params.keepalive != self.params.keepalive {
            self.next_ping = params.keepalive.map(|k| now + k);
        }
        if params.pingpong.is_none() {
            self.awaiting_pong = None;
        }
        self.params = params;
    }

    /// A message was sent or received. Keepalives do not count.
    pub fn on_activity(&mut self, now: Instant) {
        self.last_activity = self.last_activity.max(now);
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.next_ping = self.params.keepalive.map(|k| now + k);
        if self.params.pingpong.is_some() && self.awaiting_pong.is_none() {
            self.awaiting_pong = Some(now);
        }
    }

    pub fn on_pong(&mut self) {
        self.awaiting_pong = None;
    }

    /// Tracks whether a partial message is sitting in the receive buffer.
    pub fn set_incomplete(&mut self, incomplete: bool, now: Instant) {
        match (incomplete, self.incomplete_since) {
            (true, None) => self.incomplete_since = Some(now),
            (false, Some(_)) => self.incomplete_since = None,
            _ => {}
        }
    }

    fn deadlines(&self) -> [(Option<Instant>, TimerAction); 4] {
        let p = &self.params;
        [
            (
                self.awaiting_pong.zip(p.pingpong).map(|(at, d)| at + d),
                TimerAction::PongTimeout,
            ),
            (
                self.incomplete_since
                    .zip(p.incomplete_timeout)
                    .map(|(at, d)| at + d),
                TimerAction::IncompleteTimeout,
            ),
            (p.idle.map(|d| self.last_activity + d), TimerAction::IdleTimeout),
            (self.next_ping, TimerAction::SendPing),
        ]
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines().iter().filter_map(|(at, _)| *at).min()
    }

    /// The most urgent expired timer. Closing actions win over pings.
    pub fn expired(&self, now: Instant) -> Option<TimerAction> {
        self.deadlines()
            .into_iter()
            .find(|(at, _)| at.is_some_and(|at| at <= now))
            .map(|(_, action)| action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn nothing_armed() {
        let t = SecondaryTimers::new(TimerParams::default(), Instant::now());
        assert_eq!(t.next_deadline(), None);
        assert_eq!(t.expired(Instant::now() + 1000 * MS), None);
    }

    #[test]
    fn keepalive_and_pong_timeout() {
        let t0 = Instant::now();
        let params = TimerParams::default()
            .set_keepalive(Some(100 * MS))
            .set_pingpong(Some(200 * MS));
        let mut t = SecondaryTimers::new(params, t0);
        assert_eq!(t.next_deadline(), Some(t0 + 100 * MS));
        assert_eq!(t.expired(t0 + 100 * MS), Some(TimerAction::SendPing));

        t.on_ping_sent(t0 + 100 * MS);
        assert_eq!(t.next_deadline(), Some(t0 + 200 * MS));
        t.on_ping_sent(t0 + 200 * MS);
        assert_eq!(t.expired(t0 + 300 * MS), Some(TimerAction::PongTimeout));

        t.on_pong();
        assert_eq!(t.expired(t0 + 300 * MS), Some(TimerAction::SendPing));
    }

    #[test]
    fn idle_ignores_keepalives() {
        let t0 = Instant::now();
        let params = TimerParams::default()
            .set_keepalive(Some(100 * MS))
            .set_idle(Some(500 * MS));
        let mut t = SecondaryTimers::new(params, t0);
        for i in 1..5 {
            t.on_ping_sent(t0 + i * 100 * MS);
        }
        assert_eq!(t.expired(t0 + 500 * MS), Some(TimerAction::IdleTimeout));
        t.on_activity(t0 + 450 * MS);
        assert_eq!(t.expired(t0 + 500 * MS), Some(TimerAction::SendPing));
    }

    #[test]
    fn incomplete_message() {
        let t0 = Instant::now();
        let params = TimerParams::default().set_incomplete_timeout(Some(50 * MS));
        let mut t = SecondaryTimers::new(params, t0);
        t.set_incomplete(true, t0);
        t.set_incomplete(true, t0 + 40 * MS);
        assert_eq!(t.next_deadline(), Some(t0 + 50 * MS));
        assert_eq!(t.expired(t0 + 50 * MS), Some(TimerAction::IncompleteTimeout));
        t.set_incomplete(false, t0 + 50 * MS);
        assert_eq!(t.next_deadline(), None);
    }

    #[test]
    fn update_rearms_keepalive() {
        let t0 = Instant::now();
        let mut t = SecondaryTimers::new(TimerParams::default(), t0);
        t.update(TimerParams::default().set_keepalive(Some(10 * MS)), t0 + 5 * MS);
        assert_eq!(t.next_deadline(), Some(t0 + 15 * MS));
    }
}
