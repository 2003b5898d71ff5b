//! The error taxonomy of spec.md §7, grouped by recovery policy.

/// No wire action taken; purely for observability via `publish_cb`.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Informational {
    #[error("bus opened")]
    EbusOn,
    #[error("bus closed")]
    EbusOff,
    #[error("bus locked for sending")]
    BusLocked,
    #[error("bus freed")]
    BusFreed,
    #[error("incoming message ignored")]
    MsgIgnored,
    #[error("device input flushed")]
    DeviceFlushed,
}

/// Retryable locally; the FSM keeps running within the same exchange or
/// moves on to the next cycle.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    #[error("echoed byte differed from what was written")]
    ByteDifference,
    #[error("arbitration lost against a same-class master")]
    ArbitrationLost,
    #[error("same-class master observed, retrying this slot")]
    PriorityFit,
    #[error("priority lost to a higher-priority master")]
    PriorityLost,
    #[error("master NAKed, one retransmit permitted")]
    AckNegative,
    #[error("slave response CRC invalid, one retry permitted")]
    ResponseInvalid,
    #[error("incoming message invalid, NAKed")]
    RecvMsgInvalid,
    #[error("message addressed to us has no defined handling")]
    NotDefined,
}

/// Fatal for the exchange in progress; surfaced to the caller's
/// [`SendHandle`](crate::engine::SendHandle).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeFatal {
    #[error("arbitration retries exhausted")]
    LockFailed,
    #[error("master NAKed twice")]
    AckNegativeFinal,
    #[error("master ACK byte was not ACK/NAK, or timed out")]
    AckWrong,
    #[error("slave NN out of [0,16]")]
    NNWrong,
    #[error("slave response invalid after the permitted retry")]
    ResponseInvalidFinal,
    #[error("application failed to produce a response body")]
    RespCreateFailed,
    #[error("sending the response failed")]
    RespSendFailed,
    #[error("caller asked to respond to a BC/MM telegram")]
    BadType,
    #[error("cancelled: the engine was stopped before this send completed")]
    Cancelled,
}

/// Fatal for the bus session; forces the device closed and the FSM back to
/// `Connect` after a reopen delay.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionFatal {
    #[error("device closed unexpectedly")]
    DeviceClosed,
    #[error("failed to open the device")]
    OpenFailed,
}

/// Any error the FSM can surface, tagged by its recovery-policy group.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum FsmError {
    #[error(transparent)]
    Informational(#[from] Informational),
    #[error(transparent)]
    Warning(#[from] Warning),
    #[error(transparent)]
    ExchangeFatal(#[from] ExchangeFatal),
    #[error(transparent)]
    SessionFatal(#[from] SessionFatal),
}
