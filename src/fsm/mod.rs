//! The bus finite-state machine: spec.md §4.4, the hard core of this crate.
//!
//! [`Fsm`] owns the [`Device`] exclusively and runs on a single thread
//! ([`Engine::start`](crate::engine::Engine::start) spawns it). States are a
//! tagged [`State`] value, never a trait object; each `step_*` method is a
//! pure transition taking `&mut self` and returning the next state, per
//! spec.md §9's redesign note.

pub mod error;
pub mod state;
pub use state::State;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::address;
use crate::device::{Device, DeviceError};
use crate::engine::{Command, IdentifyDecision, PublishEvent, SendOutcome, Shared};
use crate::fsm::error::{ExchangeFatal, FsmError, Informational, SessionFatal, Warning};
use crate::options::EngineOptions;
use crate::raw_dump::RawDump;
use crate::sequence::Sequence;
use crate::telegram::{Telegram, TelegramType};
use crate::{ACK, BROADCAST, EXT, NAK, SYN};

/// How a write-then-echo step failed.
enum SendFault {
    /// The device itself errored (closed, I/O error).
    Device,
    /// The echoed byte didn't match what we wrote.
    Mismatch,
}

/// The bus state machine. See the module docs and spec.md §4.4.
pub struct Fsm {
    device: Box<dyn Device>,
    shared: Arc<Shared>,
    own_master: u8,
    own_slave: u8,
    identify_cb: Box<dyn Fn(&Telegram) -> IdentifyDecision + Send>,
    publish_cb: Box<dyn FnMut(PublishEvent) + Send>,
    dump: Option<RawDump>,

    current: Option<crate::engine::PendingSend>,
    active_qq: Option<u8>,
    incoming_master: Option<Telegram>,
    pending_response_body: Option<Vec<u8>>,
    lock_countdown: u8,
    lock_retries_remaining: u8,
    idle_elapsed: Duration,
    suspended: bool,
}

impl Fsm {
    pub(crate) fn new(
        device: Box<dyn Device>,
        options: EngineOptions,
        shared: Arc<Shared>,
        identify_cb: Box<dyn Fn(&Telegram) -> IdentifyDecision + Send>,
        publish_cb: Box<dyn FnMut(PublishEvent) + Send>,
    ) -> Self {
        let own_master = options.address;
        let own_slave = address::paired_slave(own_master);
        let dump = if options.dump {
            match RawDump::open(&options.dump_file, options.dump_file_max_size_kb) {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open raw dump file, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        Self {
            device,
            shared,
            own_master,
            own_slave,
            identify_cb,
            publish_cb,
            dump,
            current: None,
            active_qq: None,
            incoming_master: None,
            pending_response_body: None,
            lock_countdown: 0,
            lock_retries_remaining: 0,
            idle_elapsed: Duration::ZERO,
            suspended: false,
        }
    }

    /// Runs the state machine until [`Engine::stop`](crate::engine::Engine::stop)
    /// clears the running flag. Drains cleanly: the device is closed and any
    /// pending send is cancelled before returning.
    pub fn run(mut self) {
        let mut state = State::Connect;
        while self.running() {
            state = self.step(state);
        }
        self.device.close();
        self.cancel_current();
    }

    fn step(&mut self, state: State) -> State {
        let next = match state {
            State::Connect => self.step_connect(),
            State::Idle => self.step_idle(),
            State::Listen => self.step_listen(),
            State::LockBus => self.step_lock_bus(),
            State::SendMessage => self.step_send_message(),
            State::RecvResponse => self.step_recv_response(),
            State::RecvMessage => self.step_recv_message(),
            State::EvalMessage => self.step_eval_message(),
            State::SendResponse => self.step_send_response(),
            State::FreeBus => self.step_free_bus(),
        };
        if next != state {
            tracing::debug!(from = ?state, to = ?next, "fsm transition");
        }
        next
    }

    // -- state transitions --------------------------------------------

    fn step_connect(&mut self) -> State {
        if let Some(Command::Close) = self.take_command() {
            self.suspended = true;
            self.device.close();
        }
        while self.suspended && self.running() {
            match self.take_command() {
                Some(Command::Open) => self.suspended = false,
                _ => self.sleep_interruptible(Duration::from_millis(200)),
            }
        }
        if self.suspended {
            return State::Connect;
        }

        match self.device.open() {
            Ok(()) => {
                if self.device.flush_input().is_ok() {
                    self.publish_status(FsmError::Informational(Informational::DeviceFlushed));
                }
                self.publish_status(FsmError::Informational(Informational::EbusOn));
                self.idle_elapsed = Duration::ZERO;
                State::Idle
            }
            Err(_) => {
                self.publish_status(FsmError::SessionFatal(SessionFatal::OpenFailed));
                self.wait_for_reopen();
                State::Connect
            }
        }
    }

    fn step_idle(&mut self) -> State {
        loop {
            if !self.running() {
                return State::Idle;
            }
            if let Some(Command::Close) = self.take_command() {
                return self.close_and_suspend();
            }
            if !self.device.check_present() {
                return self.device_died();
            }
            match self.read_byte(self.receive_timeout()) {
                Ok(SYN) => return State::Listen,
                Ok(_) => continue,
                Err(DeviceError::Timeout) => {
                    if self.advance_reopen_clock() {
                        return State::Connect;
                    }
                }
                Err(_) => return self.device_died(),
            }
        }
    }

    fn step_listen(&mut self) -> State {
        if !self.running() {
            return State::Listen;
        }
        if let Some(Command::Close) = self.take_command() {
            return self.close_and_suspend();
        }
        if !self.device.check_present() {
            return self.device_died();
        }

        match self.read_byte(self.receive_timeout()) {
            Ok(SYN) => {
                if self.lock_countdown > 0 {
                    self.lock_countdown -= 1;
                }
                if self.lock_countdown == 0 && self.ensure_pending() {
                    State::LockBus
                } else {
                    State::Listen
                }
            }
            Ok(b) if address::is_master(b) => {
                self.active_qq = Some(b);
                State::RecvMessage
            }
            Ok(_) => State::Listen,
            Err(DeviceError::Timeout) => {
                if self.advance_reopen_clock() {
                    State::Connect
                } else {
                    State::Listen
                }
            }
            Err(_) => self.device_died(),
        }
    }

    fn step_lock_bus(&mut self) -> State {
        let qq = match &self.current {
            Some(p) => p.telegram.get_master().qq,
            None => return State::Listen,
        };

        if self.write_byte(qq).is_err() {
            return self.device_died();
        }

        match self.read_byte(self.arbitration_time()) {
            Ok(b) if b == qq => {
                self.publish_status(FsmError::Informational(Informational::BusLocked));
                State::SendMessage
            }
            Ok(b) if address::priority_class(b) == address::priority_class(qq) => {
                if self.lock_retries_remaining == 0 {
                    self.fail_current(ExchangeFatal::LockFailed);
                } else {
                    self.lock_retries_remaining -= 1;
                    self.publish_warning(Warning::ArbitrationLost);
                }
                State::Listen
            }
            Ok(_) => {
                self.publish_warning(Warning::PriorityLost);
                State::Listen
            }
            Err(DeviceError::Timeout) => {
                self.publish_warning(Warning::PriorityFit);
                State::Listen
            }
            Err(_) => self.device_died(),
        }
    }

    fn step_send_message(&mut self) -> State {
        let telegram = match &self.current {
            Some(p) => p.telegram.clone(),
            None => return State::Listen,
        };
        let raw = telegram.raw().as_slice().to_vec();
        let body = &raw[1..]; // ZZ PB SB NN D.. CRCm; QQ already sent in LockBus

        match self.write_and_echo_sequence(body) {
            Ok(()) => {}
            Err(SendFault::Mismatch) => {
                self.publish_warning(Warning::ByteDifference);
                self.fail_current(ExchangeFatal::AckWrong);
                return State::FreeBus;
            }
            Err(SendFault::Device) => return self.device_died(),
        }

        if telegram.get_master().zz == BROADCAST {
            self.complete_current(SendOutcome::Ok(None));
            return State::FreeBus;
        }

        for attempt in 0..2 {
            match self.read_byte(self.receive_timeout()) {
                Ok(ACK) => {
                    return if matches!(telegram.telegram_type(), TelegramType::Mm) {
                        self.complete_current(SendOutcome::Ok(None));
                        State::FreeBus
                    } else {
                        State::RecvResponse
                    };
                }
                Ok(NAK) => {
                    self.publish_warning(Warning::AckNegative);
                    if attempt == 0 {
                        match self.write_and_echo_sequence(body) {
                            Ok(()) => continue,
                            Err(SendFault::Device) => return self.device_died(),
                            Err(SendFault::Mismatch) => {
                                self.publish_warning(Warning::ByteDifference);
                                self.fail_current(ExchangeFatal::AckNegativeFinal);
                                return State::FreeBus;
                            }
                        }
                    }
                    self.fail_current(ExchangeFatal::AckNegativeFinal);
                    return State::FreeBus;
                }
                _ => {
                    self.fail_current(ExchangeFatal::AckWrong);
                    return State::FreeBus;
                }
            }
        }
        unreachable!("loop always returns within two attempts")
    }

    fn step_recv_response(&mut self) -> State {
        for attempt in 0..2 {
            match self.read_slave_bytes() {
                Ok((raw, true)) => {
                    if self.write_byte(ACK).is_err() {
                        return self.device_died();
                    }
                    let data = raw[1..raw.len() - 1].to_vec();
                    self.complete_current(SendOutcome::Ok(Some(data)));
                    return State::FreeBus;
                }
                Ok((_, false)) => {
                    let _ = self.write_byte(NAK);
                    if attempt == 0 {
                        self.publish_warning(Warning::ResponseInvalid);
                        continue;
                    }
                    self.fail_current(ExchangeFatal::ResponseInvalidFinal);
                    return State::FreeBus;
                }
                Err(_) => {
                    self.fail_current(ExchangeFatal::NNWrong);
                    return State::FreeBus;
                }
            }
        }
        unreachable!("loop always returns within two attempts")
    }

    fn step_recv_message(&mut self) -> State {
        let qq = match self.active_qq.take() {
            Some(q) => q,
            None => return State::Listen,
        };

        let (seq, crc_ok) = match self.read_incoming_master(qq) {
            Ok(v) => v,
            Err(_) => {
                self.publish_warning(Warning::RecvMsgInvalid);
                return State::Listen;
            }
        };
        let zz = seq.at(1).expect("seq holds at least QQ ZZ PB SB NN");

        if zz == BROADCAST {
            if crc_ok {
                if let Ok(t) = Telegram::parse_wire(&seq) {
                    self.publish_telegram(t, None);
                }
            } else {
                self.publish_warning(Warning::RecvMsgInvalid);
            }
            return State::Listen;
        }

        let addressed_to_us = zz == self.own_slave || zz == self.own_master;
        if !addressed_to_us {
            return self.observe_foreign_exchange(seq, crc_ok, zz);
        }

        if !crc_ok {
            self.publish_warning(Warning::RecvMsgInvalid);
            let _ = self.write_byte(NAK);
            return State::Listen;
        }
        if self.write_byte(ACK).is_err() {
            return self.device_died();
        }

        let mut acked = seq;
        acked.push(ACK);
        let telegram = match Telegram::parse_wire(&acked) {
            Ok(t) => t,
            Err(_) => {
                self.publish_warning(Warning::RecvMsgInvalid);
                return State::Listen;
            }
        };

        if matches!(telegram.telegram_type(), TelegramType::Mm) {
            self.publish_telegram(telegram, None);
            return State::Listen;
        }

        self.incoming_master = Some(telegram);
        State::EvalMessage
    }

    fn step_eval_message(&mut self) -> State {
        let telegram = match self.incoming_master.take() {
            Some(t) => t,
            None => return State::Listen,
        };
        match (self.identify_cb)(&telegram) {
            IdentifyDecision::Respond(body) => {
                self.incoming_master = Some(telegram);
                self.pending_response_body = Some(body);
                State::SendResponse
            }
            IdentifyDecision::Ignore => {
                self.publish_status(FsmError::Informational(Informational::MsgIgnored));
                self.publish_telegram(telegram, None);
                State::Listen
            }
            IdentifyDecision::Undefined => {
                self.publish_telegram(telegram, Some(Warning::NotDefined));
                State::Listen
            }
        }
    }

    fn step_send_response(&mut self) -> State {
        let mut telegram = match self.incoming_master.take() {
            Some(t) => t,
            None => return State::Listen,
        };
        let body = match self.pending_response_body.take() {
            Some(b) => b,
            None => {
                self.publish_status(FsmError::ExchangeFatal(ExchangeFatal::RespCreateFailed));
                return State::Listen;
            }
        };
        if telegram.attach_slave(&body).is_err() {
            self.publish_status(FsmError::ExchangeFatal(ExchangeFatal::RespCreateFailed));
            return State::Listen;
        }

        let mut slave_seq = Sequence::from_bytes(body.clone());
        let crc = slave_seq.crc();
        slave_seq.push(crc);
        let wire = slave_seq.as_slice().to_vec();

        for attempt in 0..2 {
            match self.write_and_echo_sequence(&wire) {
                Ok(()) => {}
                Err(SendFault::Device) => return self.device_died(),
                Err(SendFault::Mismatch) => {
                    self.publish_warning(Warning::ByteDifference);
                    if attempt == 0 {
                        continue;
                    }
                    self.publish_status(FsmError::ExchangeFatal(ExchangeFatal::RespSendFailed));
                    return State::Listen;
                }
            }
            match self.read_byte(self.receive_timeout()) {
                Ok(ACK) => {
                    let _ = telegram.set_slave_ack(ACK);
                    self.publish_telegram(telegram, None);
                    return State::FreeBus;
                }
                Ok(NAK) => {
                    self.publish_warning(Warning::AckNegative);
                    if attempt == 0 {
                        continue;
                    }
                    let _ = telegram.set_slave_ack(NAK);
                    self.publish_telegram(telegram, Some(Warning::AckNegative));
                    return State::Listen;
                }
                _ => return self.device_died(),
            }
        }
        unreachable!("loop always returns within two attempts")
    }

    fn step_free_bus(&mut self) -> State {
        if self.write_byte(SYN).is_err() {
            return self.device_died();
        }
        match self.read_byte(self.receive_timeout()) {
            Ok(SYN) => {
                self.publish_status(FsmError::Informational(Informational::BusFreed));
                State::Listen
            }
            _ => {
                self.publish_warning(Warning::ByteDifference);
                State::Idle
            }
        }
    }

    // -- byte-level helpers ---------------------------------------------

    /// Not the addressee of this master exchange: stay synchronised by
    /// reading through the rest of it (the addressee's ACK, and for MS its
    /// slave reply) without writing anything, then publish what we saw.
    fn observe_foreign_exchange(&mut self, seq: Sequence, crc_ok: bool, zz: u8) -> State {
        if !crc_ok {
            self.publish_warning(Warning::RecvMsgInvalid);
            return State::Listen;
        }
        let master_ack = match self.read_byte(self.receive_timeout()) {
            Ok(b) => b,
            Err(_) => return State::Listen,
        };
        let mut full = seq;
        full.push(master_ack);

        if master_ack != ACK || address::is_master(zz) {
            if let Ok(t) = Telegram::parse_wire(&full) {
                self.publish_telegram(t, None);
            }
            return State::Listen;
        }

        if let Ok((raw, _)) = self.read_slave_bytes() {
            full.extend(raw.iter().copied());
            if let Ok(slave_ack) = self.read_byte(self.receive_timeout()) {
                full.push(slave_ack);
            }
        }
        if let Ok(t) = Telegram::parse_wire(&full) {
            self.publish_telegram(t, None);
        }
        State::Listen
    }

    /// Reads `QQ`'s remaining header (`ZZ PB SB NN`), `NN` data bytes, and
    /// the master CRC, honouring escape continuations throughout (spec.md
    /// §9: a bare `SYN` mid-telegram is invalid, not an extension of the
    /// read count). Returns the bytes read and whether the CRC matched.
    fn read_incoming_master(&mut self, qq: u8) -> Result<(Sequence, bool), DeviceError> {
        let mut seq = Sequence::new();
        seq.push(qq);
        for _ in 0..4 {
            seq.push(self.read_escaped_byte()?);
        }
        let nn = seq.at(4).expect("just pushed four bytes");
        if !(0..=16).contains(&(nn as usize)) {
            return Err(DeviceError::Timeout);
        }
        for _ in 0..nn {
            seq.push(self.read_escaped_byte()?);
        }
        let transmitted_crc = self.read_escaped_byte()?;
        let crc_ok = seq.crc() == transmitted_crc;
        seq.push(transmitted_crc);
        Ok((seq, crc_ok))
    }

    /// Reads a slave part (`NN' D1'..Dm' CRCs`), returning the raw bytes
    /// (including `NN'` and the CRC) and whether the CRC matched.
    fn read_slave_bytes(&mut self) -> Result<(Vec<u8>, bool), DeviceError> {
        let nn = self.read_byte(self.receive_timeout())?;
        if !(0..=16).contains(&(nn as usize)) {
            return Err(DeviceError::Timeout);
        }
        let mut raw = vec![nn];
        for _ in 0..nn {
            raw.push(self.read_escaped_byte()?);
        }
        let transmitted_crc = self.read_escaped_byte()?;
        let ok = Sequence::from_bytes(raw.clone()).crc() == transmitted_crc;
        raw.push(transmitted_crc);
        Ok((raw, ok))
    }

    /// Reads one byte, resolving an `EXT`-prefixed escape. A bare `SYN`
    /// where a data/CRC byte is expected is invalid (spec.md §9's resolved
    /// open question) and aborts the read.
    fn read_escaped_byte(&mut self) -> Result<u8, DeviceError> {
        let b = self.read_byte(self.receive_timeout())?;
        match b {
            EXT => match self.read_byte(self.receive_timeout())? {
                0x00 => Ok(EXT),
                0x01 => Ok(SYN),
                _ => Err(DeviceError::Timeout),
            },
            SYN => Err(DeviceError::Timeout),
            other => Ok(other),
        }
    }

    /// Writes `unescaped` (escaping it first) one byte at a time, verifying
    /// each write by reading back its echo.
    fn write_and_echo_sequence(&mut self, unescaped: &[u8]) -> Result<(), SendFault> {
        let escaped = Sequence::from_bytes(unescaped.to_vec()).escape();
        for b in escaped.as_slice().iter().copied() {
            self.write_byte(b).map_err(|_| SendFault::Device)?;
            let echo = self
                .read_byte(self.receive_timeout())
                .map_err(|_| SendFault::Device)?;
            if echo != b {
                return Err(SendFault::Mismatch);
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<u8, DeviceError> {
        let b = self.device.read_byte(timeout)?;
        tracing::trace!(byte = b, "read");
        self.idle_elapsed = Duration::ZERO;
        if let Some(dump) = self.dump.as_mut() {
            let _ = dump.write_byte(b);
        }
        Ok(b)
    }

    fn write_byte(&mut self, b: u8) -> Result<(), DeviceError> {
        tracing::trace!(byte = b, "write");
        self.device.write_byte(b)
    }

    fn receive_timeout(&self) -> Duration {
        Duration::from_micros(self.shared.receive_timeout_us.load(Ordering::SeqCst))
    }

    fn arbitration_time(&self) -> Duration {
        Duration::from_micros(self.shared.arbitration_time_us.load(Ordering::SeqCst))
    }

    fn reopen_time(&self) -> Duration {
        Duration::from_secs(self.shared.reopen_time_secs.load(Ordering::SeqCst).max(1))
    }

    /// Advances the reopen clock by one receive-timeout window; returns
    /// whether it tripped (the device is now closed and the FSM should
    /// return to `Connect`).
    fn advance_reopen_clock(&mut self) -> bool {
        self.idle_elapsed += self.receive_timeout();
        if self.idle_elapsed >= self.reopen_time() {
            self.device.close();
            self.idle_elapsed = Duration::ZERO;
            true
        } else {
            false
        }
    }

    fn device_died(&mut self) -> State {
        self.publish_status(FsmError::SessionFatal(SessionFatal::DeviceClosed));
        self.device.close();
        State::Connect
    }

    fn close_and_suspend(&mut self) -> State {
        self.device.close();
        self.suspended = true;
        self.publish_status(FsmError::Informational(Informational::EbusOff));
        State::Connect
    }

    fn wait_for_reopen(&mut self) {
        let total = self.reopen_time();
        let step = Duration::from_millis(200);
        let mut waited = Duration::ZERO;
        while waited < total && self.running() {
            if let Some(Command::Open) = self.take_command() {
                return;
            }
            self.sleep_interruptible(step);
            waited += step;
        }
    }

    fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn take_command(&self) -> Option<Command> {
        self.shared.command.lock().unwrap().take()
    }

    /// Blocks on the shared condvar for up to `dur`, waking early on
    /// `stop()`, `open()`, `close()`, or a new `send()`.
    fn sleep_interruptible(&self, dur: Duration) {
        let guard = self.shared.queue.lock().unwrap();
        let _ = self.shared.cv.wait_timeout(guard, dur).unwrap();
    }

    fn ensure_pending(&mut self) -> bool {
        if self.current.is_none() {
            self.current = self.shared.queue.lock().unwrap().pop_front();
            if self.current.is_some() {
                self.lock_retries_remaining = self.shared.lock_retries.load(Ordering::SeqCst);
            }
        }
        self.current.is_some()
    }

    fn complete_current(&mut self, outcome: SendOutcome) {
        if let Some(p) = self.current.take() {
            crate::engine::complete(&p.slot, outcome);
            let lock_counter = self.shared.lock_counter.load(Ordering::SeqCst);
            self.lock_countdown = crate::options::clamp_lock_counter(lock_counter);
        }
    }

    fn fail_current(&mut self, err: ExchangeFatal) {
        self.publish_status(FsmError::ExchangeFatal(err));
        self.complete_current(SendOutcome::Err(FsmError::ExchangeFatal(err)));
    }

    fn cancel_current(&mut self) {
        if self.current.is_some() {
            self.complete_current(SendOutcome::Err(FsmError::ExchangeFatal(ExchangeFatal::Cancelled)));
        }
    }

    fn publish_status(&mut self, err: FsmError) {
        match err {
            FsmError::Informational(ref e) => tracing::debug!(%e, "ebus status"),
            FsmError::Warning(ref e) => tracing::warn!(%e, "ebus warning"),
            FsmError::ExchangeFatal(ref e) => tracing::error!(%e, "exchange failed"),
            FsmError::SessionFatal(ref e) => tracing::error!(%e, "session failed"),
        }
        (self.publish_cb)(PublishEvent::Status(err));
    }

    fn publish_warning(&mut self, warning: Warning) {
        self.publish_status(FsmError::Warning(warning));
    }

    fn publish_telegram(&mut self, telegram: Telegram, warning: Option<Warning>) {
        if let Some(w) = warning {
            tracing::warn!(%w, "ebus warning");
        }
        tracing::debug!(
            qq = telegram.get_master().qq,
            zz = telegram.get_master().zz,
            valid = telegram.is_valid(),
            "telegram observed"
        );
        (self.publish_cb)(PublishEvent::Telegram { telegram, warning });
    }
}
