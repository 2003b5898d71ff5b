/// The state of the bus FSM, as described in spec.md §4.4. The diagram below
/// omits the counters and timers each transition reads or updates (lock
/// countdown, arbitration retries, the reopen clock); see [`Fsm`](super::Fsm)
/// for those.
///
/// ```text
///   +---------+  open() fails   +---------+   SYN seen    +---------+
///   | Connect |---------------->| Connect |-------------->| Listen  |<-+
///   +---------+  (after delay)  +---------+  (via Idle)   +---------+  |
///        |                                                   |   |     |
///        | open() ok                          pending+lock   |   | master
///        V                                     expired, SYN  |   | byte
///   +---------+                                              V   V
///   |  Idle   |---- next SYN ------------------------->+----------+
///   +---------+                                         | LockBus  |
///                                                        +----------+
///                                                         won |  lost
///                                                             V  (-> Listen)
///                                                      +-------------+
///                                                      | SendMessage |
///                                                      +-------------+
///                                             BC/MM done |    | MS: await reply
///                                                         V    V
///                                                 +----------+ +--------------+
///                                                 | FreeBus  | | RecvResponse |
///                                                 +----------+ +--------------+
///                                                      ^              |
///                                                      +--------------+
///
///   Listen --(master byte observed)--> RecvMessage --(valid+ACK)--> EvalMessage
///   EvalMessage --(Respond)--> SendResponse --(done)--> FreeBus
///   EvalMessage --(Ignore/Undefined)--> Listen
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Device is closed or was just found dead. Attempts `open()`, or waits
    /// out the reopen delay before retrying.
    Connect,
    /// Device is open but unsynchronised; discards bytes until the next `SYN`.
    Idle,
    /// Steady-state observer: reads one byte at a time, watching for `SYN`
    /// (our cue to arbitrate) or a master address (someone else's telegram).
    Listen,
    /// Arbitrating for the bus immediately after a `SYN`.
    LockBus,
    /// Transmitting our own master body with write-read echo verification.
    SendMessage,
    /// We sent an MS telegram and are awaiting the slave's reply.
    RecvResponse,
    /// Someone else is transmitting; framing their telegram byte by byte.
    RecvMessage,
    /// Handing a fully-parsed incoming telegram to the identify callback.
    EvalMessage,
    /// Sending our slave reply to an incoming MS telegram addressed to us.
    SendResponse,
    /// Releasing the bus with a `SYN` write after our own exchange.
    FreeBus,
}
