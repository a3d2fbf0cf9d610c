//! Line channels
//!
//! A [`LineChannel`] fans the decoded lines of one output stream out to
//! one-shot watchers (`on_line`) and permanent observers (`subscribe`).
//! The process handle's driver task feeds it with `dispatch` and shuts it
//! with `close`; nothing else writes to it.
//!
//! Lines no watcher claimed are kept in a bounded backlog, so a watcher that
//! registers after its line was printed still finds it.

use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_host_api::OutputStream;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{ProcessError, ProcessResult, race};

/// Unclaimed lines kept per channel; the oldest are dropped first
pub const BACKLOG_CAPACITY: usize = 1000;

type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type Observer = Arc<dyn Fn(&str) + Send + Sync>;

/// What a line watcher is looking for
#[derive(Clone)]
pub enum Matcher {
    /// The line contains this substring
    Contains(String),

    /// The regex matches somewhere in the line
    Regex(Regex),

    /// Arbitrary test on the line
    Predicate(Predicate),
}

impl Matcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(f))
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            Matcher::Contains(needle) => line.contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(line),
            Matcher::Predicate(f) => f(line),
        }
    }
}

impl From<&str> for Matcher {
    fn from(needle: &str) -> Self {
        Matcher::Contains(needle.to_string())
    }
}

impl From<String> for Matcher {
    fn from(needle: String) -> Self {
        Matcher::Contains(needle)
    }
}

impl From<Regex> for Matcher {
    fn from(re: Regex) -> Self {
        Matcher::Regex(re)
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Contains(needle) => f.debug_tuple("Contains").field(needle).finish(),
            Matcher::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

struct Watcher {
    id: u64,
    matcher: Matcher,
    tx: oneshot::Sender<ProcessResult<String>>,
}

#[derive(Default)]
struct ChannelState {
    watchers: Vec<Watcher>,
    observers: Vec<Observer>,
    backlog: VecDeque<String>,
    closed: Option<ProcessError>,
    next_id: u64,
}

/// Lines of one output stream, delivered to watchers and observers
#[derive(Clone)]
pub struct LineChannel {
    stream: OutputStream,
    state: Arc<Mutex<ChannelState>>,
}

impl LineChannel {
    pub fn new(stream: OutputStream) -> Self {
        Self {
            stream,
            state: Arc::new(Mutex::new(ChannelState::default())),
        }
    }

    pub fn stream(&self) -> OutputStream {
        self.stream
    }

    /// Register a permanent observer that sees every line
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.state.lock().unwrap().observers.push(Arc::new(observer));
    }

    /// Wait for the first line that satisfies `matcher`.
    ///
    /// The oldest matching unclaimed line in the backlog is taken first, even
    /// after the channel has closed. A timeout fails this call but leaves the
    /// watcher registered; it is removed when a line matches or when the
    /// channel closes.
    pub async fn on_line(&self, matcher: impl Into<Matcher>, deadline: Duration) -> ProcessResult<String> {
        let rx = self.watch(matcher.into())?;
        match race("detect output", deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProcessError::Detached),
            Err(timeout) => Err(timeout.into()),
        }
    }

    fn watch(&self, matcher: Matcher) -> ProcessResult<oneshot::Receiver<ProcessResult<String>>> {
        let mut state = self.state.lock().unwrap();
        let (tx, rx) = oneshot::channel();

        let buffered = state.backlog.iter().position(|line| matcher.matches(line));
        if let Some(line) = buffered.and_then(|index| state.backlog.remove(index)) {
            trace!(stream = %self.stream, matcher = ?matcher, "Matched buffered line");
            let _ = tx.send(Ok(line));
            return Ok(rx);
        }

        if let Some(reason) = &state.closed {
            return Err(reason.clone());
        }

        let id = state.next_id;
        state.next_id += 1;
        trace!(stream = %self.stream, watcher = id, matcher = ?matcher, "Watching for line");
        state.watchers.push(Watcher { id, matcher, tx });
        Ok(rx)
    }

    /// Number of watchers still waiting for a line
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().watchers.len()
    }

    /// Number of unclaimed lines held for late watchers
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap().backlog.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed.is_some()
    }

    /// Offer one line to every watcher in registration order, then to
    /// every observer. Matchers and observers run outside the lock.
    ///
    /// A line that no live watcher took goes to the backlog.
    pub(crate) fn dispatch(&self, line: &str) {
        let (watchers, observers) = {
            let mut state = self.state.lock().unwrap();
            if state.closed.is_some() {
                return;
            }
            (std::mem::take(&mut state.watchers), state.observers.clone())
        };

        let mut claimed = false;
        let mut remaining = Vec::with_capacity(watchers.len());
        for watcher in watchers {
            // Receiver is gone if the caller timed out
            if watcher.tx.is_closed() {
                trace!(stream = %self.stream, watcher = watcher.id, "Dropping abandoned watcher");
            } else if watcher.matcher.matches(line) {
                trace!(stream = %self.stream, watcher = watcher.id, "Line matched");
                claimed |= watcher.tx.send(Ok(line.to_string())).is_ok();
            } else {
                remaining.push(watcher);
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            // Watchers registered while the lock was released go after the older ones
            remaining.append(&mut state.watchers);
            state.watchers = remaining;

            if !claimed {
                if state.backlog.len() == BACKLOG_CAPACITY {
                    state.backlog.pop_front();
                }
                state.backlog.push_back(line.to_string());
            }
        }

        for observer in observers {
            observer(line);
        }
    }

    /// Stop delivering lines and fail every pending watcher with `reason`.
    /// Later registrations that find nothing in the backlog fail
    /// immediately with the same error.
    ///
    /// Returns how many watchers were failed.
    pub(crate) fn close(&self, reason: ProcessError) -> usize {
        let watchers = {
            let mut state = self.state.lock().unwrap();
            if state.closed.is_some() {
                return 0;
            }
            state.closed = Some(reason.clone());
            std::mem::take(&mut state.watchers)
        };

        let failed = watchers.len();
        for watcher in watchers {
            let _ = watcher.tx.send(Err(reason.clone()));
        }
        debug!(stream = %self.stream, failed, "Line channel closed");
        failed
    }
}

impl fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("LineChannel")
            .field("stream", &self.stream)
            .field("watchers", &state.watchers.len())
            .field("observers", &state.observers.len())
            .field("backlog", &state.backlog.len())
            .field("closed", &state.closed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_host_api::ExitStatus;
    use tokio::task::JoinHandle;

    const DEADLINE: Duration = Duration::from_millis(1000);

    fn spawn_watch(channel: &LineChannel, matcher: impl Into<Matcher>, deadline: Duration) -> JoinHandle<ProcessResult<String>> {
        let channel = channel.clone();
        let matcher = matcher.into();
        tokio::spawn(async move { channel.on_line(matcher, deadline).await })
    }

    async fn wait_for_watchers(channel: &LineChannel, count: usize) {
        while channel.pending() < count {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn matchers() {
        assert!(Matcher::from("llo").matches("Hello"));
        assert!(!Matcher::from("bye").matches("Hello"));
        assert!(Matcher::from(Regex::new(r"^listening on :\d+$").unwrap()).matches("listening on :8080"));
        assert!(Matcher::predicate(|line| line.len() == 5).matches("Hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn first_matching_line_wins() {
        let channel = LineChannel::new(OutputStream::Stdout);
        let watch = spawn_watch(&channel, "ready", DEADLINE);
        wait_for_watchers(&channel, 1).await;

        channel.dispatch("starting");
        channel.dispatch("ready on port 1");
        channel.dispatch("ready on port 2");

        assert_eq!(watch.await.unwrap().unwrap(), "ready on port 1");
        assert_eq!(channel.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_matching_watcher_sees_the_line() {
        let channel = LineChannel::new(OutputStream::Stderr);
        let first = spawn_watch(&channel, "warn", DEADLINE);
        wait_for_watchers(&channel, 1).await;
        let second = spawn_watch(&channel, Regex::new("^warn").unwrap(), DEADLINE);
        wait_for_watchers(&channel, 2).await;

        channel.dispatch("warn: disk low");

        assert_eq!(first.await.unwrap().unwrap(), "warn: disk low");
        assert_eq!(second.await.unwrap().unwrap(), "warn: disk low");
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_watcher_stays_registered() {
        let channel = LineChannel::new(OutputStream::Stdout);
        let err = channel
            .on_line("never", Duration::from_millis(10))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Failed to detect output within 0.01 second(s)");
        assert_eq!(channel.pending(), 1);

        // The abandoned watcher does not swallow the line
        channel.dispatch("never say never");
        assert_eq!(channel.pending(), 0);
        assert_eq!(channel.buffered(), 1);
        assert_eq!(channel.on_line("never", DEADLINE).await.unwrap(), "never say never");
    }

    #[tokio::test(start_paused = true)]
    async fn late_watcher_takes_buffered_line() {
        let channel = LineChannel::new(OutputStream::Stdout);
        channel.dispatch("booting");
        channel.dispatch("Hello");
        assert_eq!(channel.buffered(), 2);

        assert_eq!(channel.on_line("Hello", DEADLINE).await.unwrap(), "Hello");
        assert_eq!(channel.buffered(), 1);

        // Each buffered line is handed out once
        let err = channel
            .on_line("Hello", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_lines_are_not_buffered() {
        let channel = LineChannel::new(OutputStream::Stdout);
        let watch = spawn_watch(&channel, "ready", DEADLINE);
        wait_for_watchers(&channel, 1).await;

        channel.dispatch("ready");
        assert_eq!(watch.await.unwrap().unwrap(), "ready");
        assert_eq!(channel.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_lines_outlive_close() {
        let channel = LineChannel::new(OutputStream::Stdout);
        channel.dispatch("server ready");

        let reason = ProcessError::ExitedWhileWaiting {
            status: ExitStatus::success(),
        };
        assert_eq!(channel.close(reason.clone()), 0);

        assert_eq!(channel.on_line("ready", DEADLINE).await.unwrap(), "server ready");
        assert_eq!(channel.on_line("ready", DEADLINE).await, Err(reason));
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_drops_oldest_lines() {
        let channel = LineChannel::new(OutputStream::Stderr);
        for i in 0..=BACKLOG_CAPACITY {
            channel.dispatch(&format!("line {}", i));
        }
        assert_eq!(channel.buffered(), BACKLOG_CAPACITY);

        let first = Regex::new("^line 0$").unwrap();
        let err = channel.on_line(first, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout());

        let last = format!("line {}", BACKLOG_CAPACITY);
        assert_eq!(channel.on_line(last.as_str(), DEADLINE).await.unwrap(), last);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_pending_watchers() {
        let channel = LineChannel::new(OutputStream::Stdout);
        let watch = spawn_watch(&channel, "Hello", DEADLINE);
        wait_for_watchers(&channel, 1).await;

        let reason = ProcessError::ExitedWhileWaiting {
            status: ExitStatus::with_code(2),
        };
        assert_eq!(channel.close(reason.clone()), 1);
        assert_eq!(watch.await.unwrap(), Err(reason.clone()));

        // Closed channels refuse new watchers and deliver nothing
        assert_eq!(channel.on_line("Hello", DEADLINE).await, Err(reason));
        channel.dispatch("Hello");
        assert_eq!(channel.pending(), 0);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn observers_see_every_line_in_order() {
        let channel = LineChannel::new(OutputStream::Stdout);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe(move |line| sink.lock().unwrap().push(line.to_string()));

        channel.dispatch("one");
        channel.dispatch("two");
        channel.close(ProcessError::Detached);
        channel.dispatch("three");

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }
}
