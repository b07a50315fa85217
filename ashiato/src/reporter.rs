//! Emission of terminated flows.
//!
//! The reap loop periodically expires the state and drains its done queue
//! into a [Reporter]. Draining happens outside of the state lock so a slow
//! reporter never blocks event ingestion.

use std::{
    fs::{DirBuilder, OpenOptions},
    io::{self, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use log::{error, info};
use tokio::sync::watch;

use crate::{events::FlowEvent, events::Renderer, state::State};

/// Sink of flow reports
pub trait Reporter: Send + Sync {
    /// Emits a report, returns false once the sink is terminated and
    /// nothing more should be sent to it.
    fn event(&self, ev: FlowEvent) -> bool;

    /// Resolves when the sink must be abandoned
    fn done(&self) -> Done;
}

/// Receiving side of a cancellation signal
#[derive(Debug, Clone)]
pub struct Done(watch::Receiver<bool>);

impl Done {
    #[inline(always)]
    pub fn is_done(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits for the signal. If the [Canceller] is dropped without having
    /// cancelled, the signal will never come.
    pub async fn wait(&mut self) {
        if self.0.wait_for(|done| *done).await.is_err() {
            std::future::pending::<()>().await
        }
    }
}

/// Sending side of a cancellation signal
#[derive(Debug)]
pub struct Canceller(watch::Sender<bool>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

pub fn done_channel() -> (Canceller, Done) {
    let (tx, rx) = watch::channel(false);
    (Canceller(tx), Done(rx))
}

pub enum Output {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(std::fs::File),
}

impl Output {
    #[inline(always)]
    pub fn stdout() -> Self {
        Self::Stdout(io::stdout())
    }

    #[inline(always)]
    pub fn stderr() -> Self {
        Self::Stderr(io::stderr())
    }

    /// Opens an output from its configuration string. Files are opened in
    /// append mode and only readable by the owner.
    pub fn open<S: AsRef<str>>(output: S) -> io::Result<Self> {
        let out = match output.as_ref() {
            "stdout" | "/dev/stdout" => Self::stdout(),
            "stderr" | "/dev/stderr" => Self::stderr(),
            v => {
                let path = PathBuf::from(v);

                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        // we only create parent directory
                        DirBuilder::new().mode(0o700).create(parent)?;
                    }
                }

                Self::File(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .mode(0o600)
                        .open(path)?,
                )
            }
        };
        Ok(out)
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout(o) => o.write(buf),
            Self::Stderr(o) => o.write(buf),
            Self::File(o) => o.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(o) => o.flush(),
            Self::Stderr(o) => o.flush(),
            Self::File(o) => o.flush(),
        }
    }
}

/// Writes reports as JSON lines. The reporter terminates itself on the
/// first write error.
pub struct JsonReporter {
    out: Mutex<Output>,
    canceller: Canceller,
    done: Done,
}

impl JsonReporter {
    pub fn new(out: Output) -> Self {
        let (canceller, done) = done_channel();
        Self {
            out: Mutex::new(out),
            canceller,
            done,
        }
    }

    fn write(&self, ev: &FlowEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(ev)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

impl Reporter for JsonReporter {
    fn event(&self, ev: FlowEvent) -> bool {
        if self.done.is_done() {
            return false;
        }

        if let Err(e) = self.write(&ev) {
            error!("failed to write report: {e}");
            self.canceller.cancel();
            return false;
        }
        true
    }

    fn done(&self) -> Done {
        self.done.clone()
    }
}

/// Reports every flow of the done queue, returns false if the reporter
/// terminated in the middle.
pub fn flush<R: Reporter + ?Sized>(state: &State, reporter: &R, renderer: &Renderer) -> bool {
    for f in state.done_flows() {
        if !reporter.event(renderer.render(&f)) {
            return false;
        }
    }
    true
}

/// Expires the state every `interval` and reports terminated flows until
/// `shutdown` is signaled or the reporter terminates.
pub async fn reap_loop<R: Reporter + ?Sized>(
    state: Arc<State>,
    reporter: Arc<R>,
    renderer: Arc<Renderer>,
    interval: Duration,
    mut shutdown: Done,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut sink = reporter.done();

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = sink.wait() => return,
            _ = ticker.tick() => {}
        }

        state.expire_older();
        if !flush(&state, reporter.as_ref(), &renderer) {
            info!("reporter terminated, stopping reap loop");
            return;
        }
    }
}

/// Logs state statistics every `interval`
pub async fn log_state_loop(state: Arc<State>, interval: Duration, mut shutdown: Done) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    // first tick is immediate
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = ticker.tick() => info!("state: {}", state.stats()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use chrono::Utc;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::Config,
        state::flow::{Endpoint, Flow, Protocol},
        util::account::Accounts,
    };

    /// Keeps reports in memory and terminates after `max` of them
    struct Collector {
        events: Mutex<Vec<FlowEvent>>,
        max: usize,
        canceller: Canceller,
        done: Done,
    }

    impl Collector {
        fn new(max: usize) -> Self {
            let (canceller, done) = done_channel();
            Self {
                events: Mutex::new(vec![]),
                max,
                canceller,
                done,
            }
        }

        fn len(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    impl Reporter for Collector {
        fn event(&self, ev: FlowEvent) -> bool {
            let mut events = self.events.lock().unwrap();
            if events.len() >= self.max {
                self.canceller.cancel();
                return false;
            }
            events.push(ev);
            true
        }

        fn done(&self) -> Done {
            self.done.clone()
        }
    }

    fn state_with_flows(n: u64) -> Arc<State> {
        let s = State::with_clock(&Config::default(), Arc::new(ManualClock::new(Utc::now())));
        for i in 0..n {
            s.update_flow(
                Flow::new(i + 1, i)
                    .with_proto(Protocol::Tcp)
                    .with_local(Endpoint::new(Some("10.0.0.1:1234".parse().unwrap())))
                    .with_remote(Endpoint::new(Some("10.0.0.2:80".parse().unwrap()))),
            );
        }
        s.terminate_all();
        Arc::new(s)
    }

    fn renderer() -> Arc<Renderer> {
        Arc::new(Renderer::new(uuid::Uuid::new_v4(), Accounts::default()))
    }

    #[tokio::test]
    async fn test_reap_loop_reporter_terminated() {
        let state = state_with_flows(3);
        let reporter = Arc::new(Collector::new(2));
        let (_canceller, shutdown) = done_channel();

        tokio::time::timeout(
            Duration::from_secs(5),
            reap_loop(
                state.clone(),
                reporter.clone(),
                renderer(),
                Duration::from_millis(10),
                shutdown,
            ),
        )
        .await
        .unwrap();

        assert_eq!(reporter.len(), 2);
        assert!(reporter.done().is_done());
    }

    #[tokio::test]
    async fn test_reap_loop_shutdown() {
        let state = state_with_flows(1);
        let reporter = Arc::new(Collector::new(usize::MAX));
        let (canceller, shutdown) = done_channel();

        let task = tokio::spawn(reap_loop(
            state,
            reporter.clone(),
            renderer(),
            Duration::from_millis(10),
            shutdown,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reporter.len(), 1);
    }

    #[test]
    fn test_json_reporter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("flows.json");

        let reporter = JsonReporter::new(Output::open(path.to_string_lossy()).unwrap());
        let state = state_with_flows(2);
        assert!(flush(&state, &reporter, &renderer()));

        let mut s = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut s)
            .unwrap();

        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(lines.len(), 2);
        for l in lines {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            assert_eq!(v["network"]["transport"], "tcp");
            assert_eq!(v["flow"]["final"], true);
        }
    }
}
