//! Client wire messages
//!
//! The message union exchanged with gateway clients: MRC command requests,
//! gateway control requests, responses and notifications. Messages are a
//! tagged union with explicit field numbering (protobuf semantics via prost
//! derives) so the wire format can evolve additively. Tag groups: MRC
//! requests 1-10, control requests 20-27, MRC responses 41-46, generic
//! responses 50-52, notifications 60-66.

use prost::Message;

/// Highest valid bus number
pub const MAX_BUS: u32 = 1;
/// Highest valid device address on a bus
pub const MAX_DEV: u32 = 15;
/// Highest valid parameter address on a device
pub const MAX_PAR: u32 = 255;
/// Largest block read size accepted on the wire
pub const MAX_READ_MULTI_COUNT: u32 = 256;
/// Number of device slots reported by a scanbus sweep
pub const SCANBUS_SLOTS: usize = 16;

/// Error taxonomy reported to clients
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorKind {
    Unknown = 0,
    InvalidType = 1,
    InvalidSize = 2,
    BusOutOfRange = 3,
    DevOutOfRange = 4,
    NoResponse = 5,
    CommTimeout = 6,
    CommError = 7,
    Silenced = 8,
    ConnectError = 9,
    PermissionDenied = 10,
    ParseError = 11,
    AddressConflict = 12,
    RequestCanceled = 13,
    ReadOutOfBounds = 14,
    Connecting = 15,
}

/// Remote-control state of one device slot in a scanbus result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RcState {
    Off = 0,
    On = 1,
    AddressConflict = 2,
}

/// MRC link status as reported to clients
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LinkStatus {
    Stopped = 0,
    Connecting = 1,
    Initializing = 2,
    Running = 3,
    ConnectFailed = 4,
    InitFailed = 5,
}

impl LinkStatus {
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            LinkStatus::Stopped | LinkStatus::ConnectFailed | LinkStatus::InitFailed
        )
    }
}

// ---------------------------------------------------------------------------
// MRC command requests
// ---------------------------------------------------------------------------

/// Enumerate the devices on one bus
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ScanbusRequest {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
}

/// Read a single parameter; `mirror` selects the mirror memory region
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReadRequest {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    #[prost(uint32, tag = "3")]
    pub par: u32,
    #[prost(bool, tag = "4")]
    pub mirror: bool,
}

/// Set a single parameter; `mirror` selects the mirror memory region
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SetRequest {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    #[prost(uint32, tag = "3")]
    pub par: u32,
    #[prost(sint32, tag = "4")]
    pub value: i32,
    #[prost(bool, tag = "5")]
    pub mirror: bool,
}

/// Switch a device's remote-control mode on or off
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RcRequest {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    #[prost(bool, tag = "3")]
    pub on: bool,
}

/// Reset a device to its power-up state
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ResetRequest {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
}

/// Copy a device's mirror memory into its main memory
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CopyRequest {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
}

/// Read a consecutive block of parameters
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReadMultiRequest {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    #[prost(uint32, tag = "3")]
    pub par: u32,
    #[prost(uint32, tag = "4")]
    pub count: u32,
}

// ---------------------------------------------------------------------------
// Gateway control requests
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HasWriteAccessRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct AcquireWriteAccessRequest {
    /// Take write access even if another client currently holds it
    #[prost(bool, tag = "1")]
    pub force: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReleaseWriteAccessRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct IsSilencedRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SetSilencedRequest {
    #[prost(bool, tag = "1")]
    pub silenced: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct MrcStatusRequest {}

/// One poll entry: `count` consecutive parameters starting at `par`
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PollItem {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    #[prost(uint32, tag = "3")]
    pub par: u32,
    #[prost(uint32, tag = "4")]
    pub count: u32,
}

/// Replace the requesting client's set of background poll items
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetPollItemsRequest {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<PollItem>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// One device slot of a scanbus result
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ScanbusEntry {
    /// Device identifier code, 0 when no device is connected
    #[prost(uint32, tag = "1")]
    pub idc: u32,
    #[prost(enumeration = "RcState", tag = "2")]
    pub rc: i32,
}

impl ScanbusEntry {
    pub fn rc_state(&self) -> RcState {
        RcState::try_from(self.rc).unwrap_or(RcState::Off)
    }
}

/// Result of a scanbus sweep: 16 slots for one bus
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanbusResult {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<ScanbusEntry>,
}

impl ScanbusResult {
    /// An all-empty result with 16 slots of `(0, Off)`
    pub fn empty(bus: u32) -> Self {
        Self {
            bus,
            entries: vec![ScanbusEntry::default(); SCANBUS_SLOTS],
        }
    }
}

/// Result of a single parameter read
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReadResult {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    #[prost(uint32, tag = "3")]
    pub par: u32,
    #[prost(sint32, tag = "4")]
    pub value: i32,
    #[prost(bool, tag = "5")]
    pub mirror: bool,
}

/// Result of a parameter set: the read-back value plus the requested one.
/// Also the payload of the set notification broadcast to other clients.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SetResult {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    #[prost(uint32, tag = "3")]
    pub par: u32,
    /// Device memory value after the set
    #[prost(sint32, tag = "4")]
    pub value: i32,
    /// Value the client asked for
    #[prost(sint32, tag = "5")]
    pub requested: i32,
    #[prost(bool, tag = "6")]
    pub mirror: bool,
}

/// Result of a block read
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadMultiResult {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    #[prost(uint32, tag = "3")]
    pub par: u32,
    #[prost(sint32, repeated, tag = "4")]
    pub values: Vec<i32>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct BoolResponse {
    #[prost(bool, tag = "1")]
    pub value: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResponse {
    #[prost(enumeration = "ErrorKind", tag = "1")]
    pub kind: i32,
    /// Optional human-readable detail
    #[prost(string, tag = "2")]
    pub info: String,
}

/// Current MRC link status; used both as a response and as a notification
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MrcStatus {
    #[prost(enumeration = "LinkStatus", tag = "1")]
    pub code: i32,
    /// Failure reason when the status is a failed or stopped state
    #[prost(string, tag = "2")]
    pub reason: String,
    /// MRC firmware version when known
    #[prost(string, tag = "3")]
    pub version: String,
    /// Whether the firmware supports block reads
    #[prost(bool, tag = "4")]
    pub has_read_multi: bool,
    #[prost(string, tag = "5")]
    pub info: String,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct WriteAccessNotification {
    #[prost(bool, tag = "1")]
    pub has_access: bool,
    #[prost(bool, tag = "2")]
    pub can_acquire: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SilencedNotification {
    #[prost(bool, tag = "1")]
    pub silenced: bool,
}

/// One polled address range with its freshly read values
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PolledValues {
    #[prost(uint32, tag = "1")]
    pub bus: u32,
    #[prost(uint32, tag = "2")]
    pub dev: u32,
    /// First parameter of the run
    #[prost(uint32, tag = "3")]
    pub par: u32,
    #[prost(sint32, repeated, tag = "4")]
    pub values: Vec<i32>,
}

/// Values collected by one complete poll cycle
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PolledItemsNotification {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<PolledValues>,
}

// ---------------------------------------------------------------------------
// The message union
// ---------------------------------------------------------------------------

/// Top-level wire message: exactly one body variant is populated
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(
        oneof = "Body",
        tags = "1, 2, 3, 6, 8, 9, 10, 20, 21, 22, 23, 24, 26, 27, 41, 42, 43, 46, 50, 51, 52, 60, 61, 62, 64, 65, 66"
    )]
    pub body: Option<Body>,
}

/// The message variants. Tag numbers are part of the wire contract.
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Body {
    // MRC command requests
    #[prost(message, tag = "1")]
    Scanbus(ScanbusRequest),
    #[prost(message, tag = "2")]
    Read(ReadRequest),
    #[prost(message, tag = "3")]
    Set(SetRequest),
    #[prost(message, tag = "6")]
    Rc(RcRequest),
    #[prost(message, tag = "8")]
    Reset(ResetRequest),
    #[prost(message, tag = "9")]
    Copy(CopyRequest),
    #[prost(message, tag = "10")]
    ReadMulti(ReadMultiRequest),

    // Gateway control requests
    #[prost(message, tag = "20")]
    HasWriteAccess(HasWriteAccessRequest),
    #[prost(message, tag = "21")]
    AcquireWriteAccess(AcquireWriteAccessRequest),
    #[prost(message, tag = "22")]
    ReleaseWriteAccess(ReleaseWriteAccessRequest),
    #[prost(message, tag = "23")]
    IsSilenced(IsSilencedRequest),
    #[prost(message, tag = "24")]
    SetSilenced(SetSilencedRequest),
    #[prost(message, tag = "26")]
    MrcStatusRequest(MrcStatusRequest),
    #[prost(message, tag = "27")]
    SetPollItems(SetPollItemsRequest),

    // MRC command responses
    #[prost(message, tag = "41")]
    ScanbusResult(ScanbusResult),
    #[prost(message, tag = "42")]
    ReadResult(ReadResult),
    #[prost(message, tag = "43")]
    SetResult(SetResult),
    #[prost(message, tag = "46")]
    ReadMultiResult(ReadMultiResult),

    // Generic responses
    #[prost(message, tag = "50")]
    Bool(BoolResponse),
    #[prost(message, tag = "51")]
    Error(ErrorResponse),
    #[prost(message, tag = "52")]
    MrcStatusResponse(MrcStatus),

    // Notifications
    #[prost(message, tag = "60")]
    NotifyWriteAccess(WriteAccessNotification),
    #[prost(message, tag = "61")]
    NotifySilenced(SilencedNotification),
    #[prost(message, tag = "62")]
    NotifySet(SetResult),
    #[prost(message, tag = "64")]
    NotifyMrcStatus(MrcStatus),
    #[prost(message, tag = "65")]
    NotifyPolledItems(PolledItemsNotification),
    #[prost(message, tag = "66")]
    NotifyScanbus(ScanbusResult),
}

impl From<Body> for Envelope {
    fn from(body: Body) -> Self {
        Envelope { body: Some(body) }
    }
}

impl Envelope {
    /// Encode to the raw payload bytes carried inside a client frame
    pub fn to_payload(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode from raw frame payload bytes
    pub fn from_payload(data: &[u8]) -> Result<Self, prost::DecodeError> {
        Envelope::decode(data)
    }
}

impl Body {
    /// True for requests that translate to an MRC command string
    pub fn is_mrc_request(&self) -> bool {
        matches!(
            self,
            Body::Scanbus(_)
                | Body::Read(_)
                | Body::Set(_)
                | Body::Rc(_)
                | Body::Reset(_)
                | Body::Copy(_)
                | Body::ReadMulti(_)
        )
    }

    /// True for MRC commands that require write access
    pub fn is_mrc_write_request(&self) -> bool {
        matches!(
            self,
            Body::Scanbus(_)
                | Body::Set(_)
                | Body::Rc(_)
                | Body::Reset(_)
                | Body::Copy(_)
                | Body::ReadMulti(_)
        )
    }

    /// True for any request variant (MRC command or gateway control)
    pub fn is_request(&self) -> bool {
        self.is_mrc_request()
            || matches!(
                self,
                Body::HasWriteAccess(_)
                    | Body::AcquireWriteAccess(_)
                    | Body::ReleaseWriteAccess(_)
                    | Body::IsSilenced(_)
                    | Body::SetSilenced(_)
                    | Body::MrcStatusRequest(_)
                    | Body::SetPollItems(_)
            )
    }

    /// Wire-level validity beyond what decoding checks. Violations terminate
    /// the client connection, like any other malformed frame.
    pub fn wire_valid(&self) -> bool {
        match self {
            Body::ReadMulti(r) => (1..=MAX_READ_MULTI_COUNT).contains(&r.count),
            _ => true,
        }
    }

    /// Range-check the address fields of an MRC request. Violations are
    /// answered with an error response; the connection stays open.
    pub fn address_error(&self) -> Option<ErrorKind> {
        let (bus, dev, par) = match self {
            Body::Scanbus(r) => (r.bus, 0, 0),
            Body::Read(r) => (r.bus, r.dev, r.par),
            Body::Set(r) => (r.bus, r.dev, r.par),
            Body::Rc(r) => (r.bus, r.dev, 0),
            Body::Reset(r) => (r.bus, r.dev, 0),
            Body::Copy(r) => (r.bus, r.dev, 0),
            Body::ReadMulti(r) => (r.bus, r.dev, r.par),
            _ => return None,
        };
        if bus > MAX_BUS {
            return Some(ErrorKind::BusOutOfRange);
        }
        if dev > MAX_DEV {
            return Some(ErrorKind::DevOutOfRange);
        }
        if par > MAX_PAR {
            return Some(ErrorKind::ReadOutOfBounds);
        }
        if let Body::ReadMulti(r) = self {
            if r.par + r.count > MAX_PAR + 1 {
                return Some(ErrorKind::ReadOutOfBounds);
            }
        }
        None
    }

    /// Short variant name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Scanbus(_) => "request_scanbus",
            Body::Read(_) => "request_read",
            Body::Set(_) => "request_set",
            Body::Rc(_) => "request_rc",
            Body::Reset(_) => "request_reset",
            Body::Copy(_) => "request_copy",
            Body::ReadMulti(_) => "request_read_multi",
            Body::HasWriteAccess(_) => "request_has_write_access",
            Body::AcquireWriteAccess(_) => "request_acquire_write_access",
            Body::ReleaseWriteAccess(_) => "request_release_write_access",
            Body::IsSilenced(_) => "request_is_silenced",
            Body::SetSilenced(_) => "request_set_silenced",
            Body::MrcStatusRequest(_) => "request_mrc_status",
            Body::SetPollItems(_) => "request_set_poll_items",
            Body::ScanbusResult(_) => "response_scanbus",
            Body::ReadResult(_) => "response_read",
            Body::SetResult(_) => "response_set",
            Body::ReadMultiResult(_) => "response_read_multi",
            Body::Bool(_) => "response_bool",
            Body::Error(_) => "response_error",
            Body::MrcStatusResponse(_) => "response_mrc_status",
            Body::NotifyWriteAccess(_) => "notify_write_access",
            Body::NotifySilenced(_) => "notify_silenced",
            Body::NotifySet(_) => "notify_set",
            Body::NotifyMrcStatus(_) => "notify_mrc_status",
            Body::NotifyPolledItems(_) => "notify_polled_items",
            Body::NotifyScanbus(_) => "notify_scanbus",
        }
    }

    // -- factory helpers ----------------------------------------------------

    pub fn read(bus: u32, dev: u32, par: u32, mirror: bool) -> Self {
        Body::Read(ReadRequest {
            bus,
            dev,
            par,
            mirror,
        })
    }

    pub fn error(kind: ErrorKind) -> Self {
        Body::Error(ErrorResponse {
            kind: kind as i32,
            info: String::new(),
        })
    }

    pub fn error_with_info(kind: ErrorKind, info: impl Into<String>) -> Self {
        Body::Error(ErrorResponse {
            kind: kind as i32,
            info: info.into(),
        })
    }

    pub fn bool_response(value: bool) -> Self {
        Body::Bool(BoolResponse { value })
    }

    pub fn notify_write_access(has_access: bool, can_acquire: bool) -> Self {
        Body::NotifyWriteAccess(WriteAccessNotification {
            has_access,
            can_acquire,
        })
    }

    pub fn notify_silenced(silenced: bool) -> Self {
        Body::NotifySilenced(SilencedNotification { silenced })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let body = Body::Set(SetRequest {
            bus: 1,
            dev: 3,
            par: 7,
            value: -99,
            mirror: true,
        });
        let env = Envelope::from(body.clone());
        let bytes = env.to_payload();
        let decoded = Envelope::from_payload(&bytes).unwrap();
        assert_eq!(decoded.body, Some(body));
    }

    #[test]
    fn test_empty_envelope_has_no_body() {
        let decoded = Envelope::from_payload(&[]).unwrap();
        assert!(decoded.body.is_none());
    }

    #[test]
    fn test_unknown_tag_is_preserved_as_no_body() {
        // A field with an unknown tag decodes, but yields no populated body.
        let mut buf = Vec::new();
        prost::encoding::encode_varint((200 << 3) | 2, &mut buf);
        prost::encoding::encode_varint(0, &mut buf);
        let decoded = Envelope::from_payload(&buf).unwrap();
        assert!(decoded.body.is_none());
    }

    #[test]
    fn test_read_multi_count_bounds() {
        for count in [1, 256] {
            let body = Body::ReadMulti(ReadMultiRequest {
                bus: 0,
                dev: 0,
                par: 0,
                count,
            });
            assert!(body.wire_valid(), "count {count} must be accepted");
        }
        for count in [0, 257] {
            let body = Body::ReadMulti(ReadMultiRequest {
                bus: 0,
                dev: 0,
                par: 0,
                count,
            });
            assert!(!body.wire_valid(), "count {count} must be rejected");
        }
    }

    #[test]
    fn test_address_validation() {
        assert_eq!(Body::read(0, 0, 0, false).address_error(), None);
        assert_eq!(Body::read(1, 15, 255, true).address_error(), None);
        assert_eq!(
            Body::read(2, 0, 0, false).address_error(),
            Some(ErrorKind::BusOutOfRange)
        );
        assert_eq!(
            Body::read(0, 16, 0, false).address_error(),
            Some(ErrorKind::DevOutOfRange)
        );
        assert_eq!(
            Body::read(0, 0, 256, false).address_error(),
            Some(ErrorKind::ReadOutOfBounds)
        );
        // A block read must not run past the last parameter.
        let body = Body::ReadMulti(ReadMultiRequest {
            bus: 0,
            dev: 0,
            par: 200,
            count: 100,
        });
        assert_eq!(body.address_error(), Some(ErrorKind::ReadOutOfBounds));
    }

    #[test]
    fn test_write_classification() {
        assert!(!Body::read(0, 0, 0, false).is_mrc_write_request());
        assert!(Body::Scanbus(ScanbusRequest { bus: 0 }).is_mrc_write_request());
        assert!(Body::Set(SetRequest::default()).is_mrc_write_request());
        assert!(Body::ReadMulti(ReadMultiRequest {
            bus: 0,
            dev: 0,
            par: 0,
            count: 1
        })
        .is_mrc_write_request());
        assert!(!Body::HasWriteAccess(HasWriteAccessRequest {}).is_mrc_request());
    }
}
