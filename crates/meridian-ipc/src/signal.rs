//! Cross-process write signal
//!
//! Every committed write updates a sentinel file beside the database with
//! the writing process's token and a counter; sibling processes watch the
//! file and treat any foreign token as "at least one external write
//! happened since you last checked". The signal is advisory and carries
//! no payload or ordering guarantee.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

use crate::activation::ProcessActivation;
use crate::error::IpcError;
use crate::Result;

const SIGNAL_SUFFIX: &str = "-signal";

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    always: Vec<Callback>,
    when_active: Vec<Callback>,
}

/// One notifier per process and database file.
///
/// Signaling is decoupled from the writer: `notify_changed_async` enqueues
/// to a dedicated thread that performs the filesystem write, so a commit
/// never blocks on signal publication.
pub struct CrossProcessNotifier {
    token: Uuid,
    signal_path: PathBuf,
    activation: Arc<ProcessActivation>,
    callbacks: Arc<Mutex<Callbacks>>,
    signal_tx: mpsc::Sender<()>,
    // Kept alive for the notifier's lifetime; wrapped so the notifier can
    // be shared across threads.
    _watcher: Mutex<RecommendedWatcher>,
}

impl CrossProcessNotifier {
    /// Creates the notifier for the database at `database_path`. The
    /// sentinel file lives beside the database (`<database>-signal`).
    pub fn new(database_path: &Path) -> Result<Self> {
        let signal_path = sidecar(database_path, SIGNAL_SUFFIX);
        let watch_dir = signal_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .ok_or_else(|| IpcError::InvalidPath(signal_path.display().to_string()))?;
        std::fs::create_dir_all(&watch_dir)?;

        let token = Uuid::new_v4();
        let activation = Arc::new(ProcessActivation::new());
        let callbacks = Arc::new(Mutex::new(Callbacks::default()));

        let (signal_tx, signal_rx) = mpsc::channel::<()>();
        {
            let signal_path = signal_path.clone();
            thread::Builder::new()
                .name("meridian-ipc-signal".into())
                .spawn(move || signal_writer_loop(signal_rx, signal_path, token))?;
        }

        let mut watcher = {
            let signal_path = signal_path.clone();
            let activation = Arc::clone(&activation);
            let callbacks = Arc::clone(&callbacks);
            let mut last_payload = String::new();
            notify::recommended_watcher(move |event: notify::Result<Event>| match event {
                Ok(event) => handle_event(
                    &event,
                    &signal_path,
                    token,
                    &mut last_payload,
                    &activation,
                    &callbacks,
                ),
                Err(err) => tracing::warn!(error = %err, "Signal watcher error"),
            })?
        };
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        tracing::debug!(
            path = %signal_path.display(),
            token = %token,
            "Cross-process notifier started"
        );

        Ok(Self {
            token,
            signal_path,
            activation,
            callbacks,
            signal_tx,
            _watcher: Mutex::new(watcher),
        })
    }

    /// Announces a committed write to sibling processes.
    ///
    /// Fire-and-forget: the caller enqueues to the signaling thread and
    /// returns immediately, never touching the filesystem itself. Bursts
    /// coalesce on the signaling thread.
    pub fn notify_changed_async(&self) {
        let _ = self.signal_tx.send(());
    }

    /// Registers a callback fired for every observed external write,
    /// regardless of activation state. Runs off the signaling call stack,
    /// on the watcher thread.
    pub fn on_change_always(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().always.push(Arc::new(callback));
    }

    /// Registers an activation-gated callback: fired promptly while the
    /// process is active, otherwise coalesced into a single deferred
    /// delivery on the next foreground transition.
    pub fn on_change_when_active(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().when_active.push(Arc::new(callback));
    }

    /// Applies a foreground/background transition, delivering at most one
    /// deferred external-write callback on background-to-foreground.
    pub fn set_process_active(&self, active: bool) {
        if self.activation.transition(active) {
            tracing::debug!("Delivering coalesced external write signal");
            let deferred = self.callbacks.lock().when_active.clone();
            for callback in &deferred {
                callback();
            }
        }
    }

    pub fn is_process_active(&self) -> bool {
        self.activation.is_active()
    }

    /// Token written with every published signal; siblings use it to
    /// ignore their own writes.
    pub fn process_token(&self) -> Uuid {
        self.token
    }

    pub fn signal_path(&self) -> &Path {
        &self.signal_path
    }
}

fn signal_writer_loop(rx: mpsc::Receiver<()>, signal_path: PathBuf, token: Uuid) {
    let mut counter: u64 = 0;
    while rx.recv().is_ok() {
        // Drain anything queued while the previous signal was on disk;
        // receivers only need "something changed", not a count.
        while rx.try_recv().is_ok() {}
        counter += 1;
        write_signal_file(&signal_path, token, counter);
    }
}

fn write_signal_file(path: &Path, token: Uuid, counter: u64) {
    let tmp = sidecar(path, &format!(".{}.tmp", token.simple()));
    let payload = format!("{token}:{counter}");
    let result = std::fs::write(&tmp, payload).and_then(|()| std::fs::rename(&tmp, path));
    if let Err(err) = result {
        tracing::warn!(path = %path.display(), error = %err, "Failed to publish write signal");
    }
}

fn handle_event(
    event: &Event,
    signal_path: &Path,
    own_token: Uuid,
    last_payload: &mut String,
    activation: &ProcessActivation,
    callbacks: &Mutex<Callbacks>,
) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    if !event.paths.iter().any(|path| path == signal_path) {
        return;
    }

    // The rename that published the signal may race this read; a partial
    // or unchanged payload is skipped and the follow-up event retried.
    let payload = match std::fs::read_to_string(signal_path) {
        Ok(payload) => payload,
        Err(_) => return,
    };
    if payload.is_empty() || payload == *last_payload {
        return;
    }
    *last_payload = payload.clone();

    match payload.split(':').next().and_then(|t| Uuid::parse_str(t).ok()) {
        Some(token) if token == own_token => {}
        Some(_) => dispatch(activation, callbacks),
        None => tracing::debug!(path = %signal_path.display(), "Ignoring malformed signal payload"),
    }
}

fn dispatch(activation: &ProcessActivation, callbacks: &Mutex<Callbacks>) {
    let (always, when_active) = {
        let snapshot = callbacks.lock();
        let when_active = if activation.note_external_write() {
            snapshot.when_active.clone()
        } else {
            Vec::new()
        };
        (snapshot.always.clone(), when_active)
    };
    for callback in &always {
        callback();
    }
    for callback in &when_active {
        callback();
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        cond()
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn foreign_signal_reaches_active_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("store.db");
        let writer = CrossProcessNotifier::new(&db).unwrap();
        let receiver = CrossProcessNotifier::new(&db).unwrap();
        assert_ne!(writer.process_token(), receiver.process_token());
        receiver.set_process_active(true);

        let seen = Arc::new(AtomicUsize::new(0));
        receiver.on_change_when_active(counting(&seen));

        writer.notify_changed_async();
        assert!(wait_for(
            || seen.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));
    }

    #[test]
    fn own_signals_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("store.db");
        let notifier = CrossProcessNotifier::new(&db).unwrap();
        notifier.set_process_active(true);

        let seen = Arc::new(AtomicUsize::new(0));
        notifier.on_change_always(counting(&seen));

        notifier.notify_changed_async();
        assert!(!wait_for(
            || seen.load(Ordering::SeqCst) > 0,
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn background_signals_coalesce_into_one_deferred_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("store.db");
        let writer = CrossProcessNotifier::new(&db).unwrap();
        let receiver = CrossProcessNotifier::new(&db).unwrap();

        let observed = Arc::new(AtomicUsize::new(0));
        let deferred = Arc::new(AtomicUsize::new(0));
        receiver.on_change_always(counting(&observed));
        receiver.on_change_when_active(counting(&deferred));

        for _ in 0..5 {
            writer.notify_changed_async();
            thread::sleep(Duration::from_millis(150));
        }

        // The watcher must have seen at least one signal before the
        // foreground transition for a deferred delivery to be owed.
        assert!(wait_for(
            || observed.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));
        // Let in-flight watcher events drain so none lands after the
        // transition below.
        thread::sleep(Duration::from_secs(1));
        assert_eq!(deferred.load(Ordering::SeqCst), 0);

        receiver.set_process_active(true);
        assert_eq!(deferred.load(Ordering::SeqCst), 1);

        // No stragglers: repeat transitions deliver nothing further.
        receiver.set_process_active(false);
        receiver.set_process_active(true);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(deferred.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_file_lands_beside_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("store.db");
        let notifier = CrossProcessNotifier::new(&db).unwrap();

        notifier.notify_changed_async();
        let path = notifier.signal_path().to_path_buf();
        assert!(wait_for(|| path.exists(), Duration::from_secs(5)));
        assert_eq!(path, dir.path().join("store.db-signal"));
    }
}
