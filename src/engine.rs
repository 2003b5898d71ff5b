//! Hosts the bus [`Fsm`] on its own OS thread and exposes the
//! application-facing contract: enqueue a send, request open/close, observe
//! traffic. See spec.md §4.5 and §5.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::address;
use crate::device::{Device, SerialDevice, TcpDevice};
use crate::fsm::error::{ExchangeFatal, FsmError, Warning};
use crate::fsm::Fsm;
use crate::options::EngineOptions;
use crate::telegram::{Telegram, TelegramError};

/// What the identify callback decided for a telegram addressed to our slave
/// address.
pub enum IdentifyDecision {
    /// Not for us, or not worth responding to; publish and move on.
    Ignore,
    /// Respond with this raw slave body (`NN' D1'..Dm'`).
    Respond(Vec<u8>),
    /// Addressed to us, but `PB`/`SB` has no defined handling.
    Undefined,
}

/// An observation delivered to the application's publish callback.
pub enum PublishEvent {
    /// A fully-parsed telegram, successful or not, optionally tagged with
    /// the warning that accompanied it.
    Telegram {
        telegram: Telegram,
        warning: Option<Warning>,
    },
    /// An event with no telegram of its own (bus opened/closed, a session
    /// fatal error, a collision freeing the bus).
    Status(FsmError),
}

/// The terminal result of a [`SendHandle`].
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// Success. Carries the slave body for an MS exchange, `None` for BC/MM.
    Ok(Option<Vec<u8>>),
    /// The exchange failed; see [`FsmError`] for its recovery-policy group.
    Err(FsmError),
}

pub(crate) type ResultSlot = Arc<(Mutex<Option<SendOutcome>>, Condvar)>;

/// A handle to a previously-enqueued send, returned by [`Engine::send`].
pub struct SendHandle {
    slot: ResultSlot,
}

impl SendHandle {
    /// Blocks until the send completes.
    pub fn wait(&self) -> SendOutcome {
        let (lock, cv) = &*self.slot;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() {
            guard = cv.wait(guard).unwrap();
        }
        guard.clone().expect("loop only exits once Some")
    }

    /// Blocks until the send completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<SendOutcome> {
        let (lock, cv) = &*self.slot;
        let guard = lock.lock().unwrap();
        let (guard, _) = cv.wait_timeout_while(guard, timeout, |r| r.is_none()).unwrap();
        guard.clone()
    }
}

pub(crate) struct PendingSend {
    pub(crate) telegram: Telegram,
    pub(crate) slot: ResultSlot,
}

/// A non-blocking transition request made via [`Engine::open`]/[`Engine::close`].
pub(crate) enum Command {
    Open,
    Close,
}

/// The only state the FSM thread shares with the rest of the application.
///
/// The numeric tunables live here, not only in [`EngineOptions`], so that
/// [`Engine`]'s setters (spec.md §4.5) can retune a *running* FSM: the FSM
/// reads these atomics every cycle instead of a private snapshot taken at
/// construction. `address`, `device`, and the dump settings stay
/// construction-only (spec.md doesn't ask for them to change live, and
/// doing so would mean re-opening the transport or the dump file mid-run).
pub(crate) struct Shared {
    pub(crate) queue: Mutex<VecDeque<PendingSend>>,
    pub(crate) cv: Condvar,
    pub(crate) running: AtomicBool,
    pub(crate) command: Mutex<Option<Command>>,
    pub(crate) reopen_time_secs: AtomicU64,
    pub(crate) arbitration_time_us: AtomicU64,
    pub(crate) receive_timeout_us: AtomicU64,
    pub(crate) lock_counter: AtomicU8,
    pub(crate) lock_retries: AtomicU8,
}

impl Shared {
    fn new(options: &EngineOptions) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            running: AtomicBool::new(false),
            command: Mutex::new(None),
            reopen_time_secs: AtomicU64::new(options.reopen_time_secs),
            arbitration_time_us: AtomicU64::new(options.arbitration_time_us),
            receive_timeout_us: AtomicU64::new(options.receive_timeout_us),
            lock_counter: AtomicU8::new(options.lock_counter),
            lock_retries: AtomicU8::new(options.lock_retries),
        }
    }
}

/// Hosts the bus FSM on a dedicated thread and exposes the send/open/close
/// contract described in spec.md §4.5.
pub struct Engine {
    address: u8,
    slave_address: u8,
    shared: Arc<Shared>,
    fsm: Mutex<Option<Fsm>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Builds an engine for `options.address` on `options.device`. The
    /// paired slave address is derived automatically (spec.md §3). The FSM
    /// thread isn't started until [`Engine::start`] is called.
    ///
    /// `identify_cb` and `publish_cb` run on the FSM thread; they must not
    /// block and must not call back into the `Engine` except its getters
    /// (spec.md §5).
    pub fn new(
        options: EngineOptions,
        identify_cb: impl Fn(&Telegram) -> IdentifyDecision + Send + 'static,
        publish_cb: impl FnMut(PublishEvent) + Send + 'static,
    ) -> Self {
        let device = device_from_spec(&options.device, options.device_check);
        Self::with_device(device, options, identify_cb, publish_cb)
    }

    /// Builds an engine against an already-constructed [`Device`], bypassing
    /// `options.device`'s serial/TCP dispatch. Meant for embedders with a
    /// transport of their own and for exercising the FSM against a
    /// deterministic in-memory `Device` in tests.
    pub fn with_device(
        device: Box<dyn Device>,
        options: EngineOptions,
        identify_cb: impl Fn(&Telegram) -> IdentifyDecision + Send + 'static,
        publish_cb: impl FnMut(PublishEvent) + Send + 'static,
    ) -> Self {
        let address = options.address;
        let slave_address = address::paired_slave(address);
        let shared = Arc::new(Shared::new(&options));

        let fsm = Fsm::new(
            device,
            options,
            shared.clone(),
            Box::new(identify_cb),
            Box::new(publish_cb),
        );

        Self {
            address,
            slave_address,
            shared,
            fsm: Mutex::new(Some(fsm)),
            thread: Mutex::new(None),
        }
    }

    /// Our master address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Our derived slave address (`address + 5`).
    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    /// Sets the inter-send fairness counter (spec.md §4.5), clamped to
    /// `[1, 25]` by the FSM when it's next consulted. Takes effect
    /// immediately, whether or not the engine has started.
    pub fn set_lock_counter(&self, lock_counter: u8) {
        self.shared.lock_counter.store(lock_counter, Ordering::SeqCst);
    }

    /// Sets the arbitration-retry budget per send.
    pub fn set_lock_retries(&self, lock_retries: u8) {
        self.shared.lock_retries.store(lock_retries, Ordering::SeqCst);
    }

    /// Sets the seconds of dead bus tolerated before reopening the device.
    pub fn set_reopen_time_secs(&self, seconds: u64) {
        self.shared.reopen_time_secs.store(seconds, Ordering::SeqCst);
    }

    /// Sets the microsecond window for the arbitration echo.
    pub fn set_arbitration_time_us(&self, micros: u64) {
        self.shared.arbitration_time_us.store(micros, Ordering::SeqCst);
    }

    /// Sets the microsecond window for each inter-byte read.
    pub fn set_receive_timeout_us(&self, micros: u64) {
        self.shared.receive_timeout_us.store(micros, Ordering::SeqCst);
    }

    /// Spawns the FSM thread in `Connect` state. A no-op if already started.
    pub fn start(&self) {
        let mut thread_guard = self.thread.lock().unwrap();
        if thread_guard.is_some() {
            return;
        }
        let fsm = match self.fsm.lock().unwrap().take() {
            Some(fsm) => fsm,
            None => return,
        };
        self.shared.running.store(true, Ordering::SeqCst);
        *thread_guard = Some(thread::spawn(move || fsm.run()));
    }

    /// Idempotent; blocks until the FSM thread exits. Any sends still
    /// pending at that point complete with [`ExchangeFatal::Cancelled`].
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut queue = self.shared.queue.lock().unwrap();
        for pending in queue.drain(..) {
            complete(&pending.slot, SendOutcome::Err(FsmError::ExchangeFatal(ExchangeFatal::Cancelled)));
        }
    }

    /// Requests that the device be (re)opened. Non-blocking.
    pub fn open(&self) {
        *self.shared.command.lock().unwrap() = Some(Command::Open);
        self.shared.cv.notify_all();
    }

    /// Requests that the device be closed. Non-blocking.
    pub fn close(&self) {
        *self.shared.command.lock().unwrap() = Some(Command::Close);
        self.shared.cv.notify_all();
    }

    /// Enqueues a master body (`ZZ PB SB NN D…`) for sending, in FIFO order.
    pub fn send(&self, master_body: &[u8]) -> Result<SendHandle, TelegramError> {
        let telegram = Telegram::from_master_bytes(self.address, master_body)?;
        let slot: ResultSlot = Arc::new((Mutex::new(None), Condvar::new()));
        self.shared.queue.lock().unwrap().push_back(PendingSend {
            telegram,
            slot: slot.clone(),
        });
        self.shared.cv.notify_all();
        Ok(SendHandle { slot })
    }
}

pub(crate) fn complete(slot: &ResultSlot, outcome: SendOutcome) {
    let (lock, cv) = &**slot;
    *lock.lock().unwrap() = Some(outcome);
    cv.notify_all();
}

/// Chooses a transport from a device spec: `host:port` for TCP, anything
/// else is a tty path.
fn device_from_spec(spec: &str, device_check: bool) -> Box<dyn Device> {
    let looks_like_host_port = spec
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()));
    if looks_like_host_port {
        Box::new(TcpDevice::new(spec.to_string()))
    } else {
        Box::new(SerialDevice::new(spec, device_check))
    }
}
