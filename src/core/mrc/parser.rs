//! MRC reply parser
//!
//! Line-oriented state machine turning the MRC's textual output into typed
//! responses. The parser is armed with the request currently on the wire,
//! consumes one line at a time and reports when the response is complete.
//!
//! MRC error output starts with `ERR`; some commands follow an error with
//! one more line of output, which the parser consumes before declaring
//! completion so the next command starts on a clean stream.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, trace};

use crate::protocol::message::{
    Body, ErrorKind, RcState, ReadMultiResult, ReadResult, ScanbusResult, SetResult, MAX_DEV,
};

static RE_NO_RESPONSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ERR.*NO RESP.*").expect("valid regex"));
static RE_ADDR_CONFLICT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ERR.*ADDR.*").expect("valid regex"));
static RE_ERROR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ERR.*").expect("valid regex"));
static RE_READ_OR_SET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[SERM]{2} (\d+) (\d+) (\d+) (-?\d+)\s*$").expect("valid regex"));
static RE_SCANBUS_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ID-SCAN BUS (\d+):\s*$").expect("valid regex"));
// "0FF" with a digit zero, not the letter O. The hardware really emits this.
static RE_SCANBUS_BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+): (-|(\d+), (ON|0FF))\s*$").expect("valid regex"));
static RE_SCANBUS_NO_RESP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ERR:NO RESP\s*$").expect("valid regex"));
static RE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").expect("valid regex"));

/// Reply parser for the command currently on the MRC link
#[derive(Debug, Default)]
pub struct ReplyParser {
    request: Option<Body>,
    response: Option<Body>,
    error_lines_to_consume: usize,
    scanbus_address_conflict: bool,
    multi_lines_left: usize,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the parser for a new request, clearing all per-reply state
    pub fn set_request(&mut self, request: Body) {
        trace!(request = request.type_name(), "parser armed");
        self.request = Some(request);
        self.response = None;
        self.error_lines_to_consume = 0;
        self.scanbus_address_conflict = false;
        self.multi_lines_left = 0;
    }

    /// The parsed response; meaningful once `parse_line` returned `true`
    pub fn take_response(&mut self) -> Body {
        self.response
            .take()
            .unwrap_or_else(|| Body::error(ErrorKind::ParseError))
    }

    /// Feed one trimmed, non-empty line. Returns `true` when the response
    /// is complete.
    pub fn parse_line(&mut self, line: &str) -> bool {
        if self.error_lines_to_consume > 0 {
            trace!(
                remaining = self.error_lines_to_consume,
                "consuming follow-up line"
            );
            self.error_lines_to_consume -= 1;
            return self.error_lines_to_consume == 0;
        }

        match self.request.clone() {
            Some(Body::Read(_)) | Some(Body::Set(_)) => self.parse_read_or_set(line),
            Some(Body::Rc(_)) | Some(Body::Reset(_)) | Some(Body::Copy(_)) => {
                self.parse_other(line)
            }
            Some(Body::Scanbus(_)) => self.parse_scanbus(line),
            Some(Body::ReadMulti(_)) => self.parse_read_multi(line),
            other => {
                error!(
                    request = other.as_ref().map(|b| b.type_name()),
                    "request type not handled by reply parser"
                );
                self.response = Some(Body::error(ErrorKind::Unknown));
                true
            }
        }
    }

    /// Map an MRC error line to an error response, or `None` if the line is
    /// not an error
    fn match_error(&self, line: &str) -> Option<Body> {
        if RE_NO_RESPONSE.is_match(line) {
            error!("MRC: no response");
            return Some(Body::error(ErrorKind::NoResponse));
        }
        if RE_ADDR_CONFLICT.is_match(line) {
            error!("MRC: address conflict");
            return Some(Body::error(ErrorKind::AddressConflict));
        }
        if RE_ERROR.is_match(line) {
            error!(line, "MRC: error");
            return Some(Body::error(ErrorKind::Unknown));
        }
        None
    }

    fn parse_read_or_set(&mut self, line: &str) -> bool {
        if let Some(err) = self.match_error(line) {
            self.response = Some(err);
            return true;
        }

        let Some(caps) = RE_READ_OR_SET.captures(line) else {
            error!(line, "error parsing read/set reply");
            self.response = Some(Body::error(ErrorKind::ParseError));
            return true;
        };

        let bus: u32 = caps[1].parse().unwrap_or(0);
        let dev: u32 = caps[2].parse().unwrap_or(0);
        let par: u32 = caps[3].parse().unwrap_or(0);
        let value: i32 = caps[4].parse().unwrap_or(0);

        self.response = match self.request {
            Some(Body::Read(req)) => {
                // Polarity-inverted channels report negative raw readings;
                // fold them back into the device's 16-bit value space.
                let value = if value < 0 { (1 << 15) - value.abs() } else { value };
                Some(Body::ReadResult(ReadResult {
                    bus,
                    dev,
                    par,
                    value,
                    mirror: req.mirror,
                }))
            }
            Some(Body::Set(req)) => Some(Body::SetResult(SetResult {
                bus,
                dev,
                par,
                value,
                requested: req.value,
                mirror: req.mirror,
            })),
            _ => Some(Body::error(ErrorKind::ParseError)),
        };
        true
    }

    fn parse_scanbus(&mut self, line: &str) -> bool {
        if let Some(caps) = RE_SCANBUS_HEADER.captures(line) {
            let bus: u32 = caps[1].parse().unwrap_or(0);
            self.response = Some(Body::ScanbusResult(ScanbusResult::empty(bus)));
            return false;
        }

        if RE_SCANBUS_NO_RESP.is_match(line) {
            error!("error parsing scanbus reply: no response");
            self.response = Some(Body::error(ErrorKind::NoResponse));
            return true;
        }

        if RE_ADDR_CONFLICT.is_match(line) {
            // Reported on the line before the affected slot.
            self.scanbus_address_conflict = true;
            return false;
        }

        if let Some(caps) = RE_SCANBUS_BODY.captures(line) {
            let dev: usize = caps[1].parse().unwrap_or(0);
            if dev as u32 > MAX_DEV {
                error!(line, "scanbus slot out of range");
                self.response = Some(Body::error(ErrorKind::ParseError));
                return true;
            }

            match self.response {
                Some(Body::ScanbusResult(ref mut result)) => {
                    let entry = &mut result.entries[dev];
                    if let Some(idc) = caps.get(3) {
                        entry.idc = idc.as_str().parse().unwrap_or(0);
                    }
                    if let Some(rc) = caps.get(4) {
                        entry.rc = if rc.as_str() == "ON" {
                            RcState::On as i32
                        } else {
                            RcState::Off as i32
                        };
                    }
                    if self.scanbus_address_conflict {
                        debug!(dev, "scanbus: address conflict");
                        entry.rc = RcState::AddressConflict as i32;
                        self.scanbus_address_conflict = false;
                    }
                }
                _ => {
                    error!("scanbus: body line without prior header line");
                    self.response = Some(Body::error(ErrorKind::ParseError));
                    // Consume the rest of the scanbus output to resync.
                    self.error_lines_to_consume = MAX_DEV as usize - dev;
                }
            }

            return dev as u32 >= MAX_DEV;
        }

        error!(line, "error parsing scanbus reply");
        self.response = Some(Body::error(ErrorKind::ParseError));
        true
    }

    fn parse_other(&mut self, line: &str) -> bool {
        if let Some(err) = self.match_error(line) {
            self.response = Some(err);
            // These commands emit one more line after an error.
            self.error_lines_to_consume = 1;
            return false;
        }

        self.response = Some(Body::bool_response(true));
        true
    }

    fn parse_read_multi(&mut self, line: &str) -> bool {
        if let Some(err) = self.match_error(line) {
            self.response = Some(err);
            return true;
        }

        if self.multi_lines_left == 0 {
            let Some(Body::ReadMulti(req)) = self.request else {
                self.response = Some(Body::error(ErrorKind::ParseError));
                return true;
            };
            trace!(count = req.count, "read_multi: reply started");
            self.multi_lines_left = req.count as usize;
            self.response = Some(Body::ReadMultiResult(ReadMultiResult {
                bus: req.bus,
                dev: req.dev,
                par: req.par,
                values: Vec::with_capacity(req.count as usize),
            }));
        }

        if !RE_NUMBER.is_match(line) {
            error!(line, "read_multi: non-numeric response line");
            self.response = Some(Body::error(ErrorKind::ParseError));
            self.error_lines_to_consume = self.multi_lines_left - 1;
            return self.error_lines_to_consume == 0;
        }

        if let Some(Body::ReadMultiResult(ref mut result)) = self.response {
            let value: i32 = line.parse().unwrap_or(0);
            result.values.push(value);
        }

        self.multi_lines_left -= 1;
        self.multi_lines_left == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{ReadMultiRequest, ScanbusRequest, SetRequest};

    fn parse_all(parser: &mut ReplyParser, lines: &[&str]) -> Body {
        for (i, line) in lines.iter().enumerate() {
            let done = parser.parse_line(line);
            if done {
                assert_eq!(i + 1, lines.len(), "parser finished early at line {i}");
                return parser.take_response();
            }
        }
        panic!("parser did not complete");
    }

    #[test]
    fn test_parse_read() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::read(0, 0, 42, false));
        let response = parse_all(&mut parser, &["RE 0 0 42 1234"]);
        assert_eq!(
            response,
            Body::ReadResult(ReadResult {
                bus: 0,
                dev: 0,
                par: 42,
                value: 1234,
                mirror: false,
            })
        );
    }

    #[test]
    fn test_parse_read_widens_negative_values() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::read(0, 1, 7, false));
        let response = parse_all(&mut parser, &["RE 0 1 7 -1"]);
        match response {
            Body::ReadResult(r) => assert_eq!(r.value, 32767),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }

    #[test]
    fn test_parse_set_keeps_requested_value() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::Set(SetRequest {
            bus: 1,
            dev: 3,
            par: 7,
            value: 99,
            mirror: true,
        }));
        let response = parse_all(&mut parser, &["SM 1 3 7 99"]);
        assert_eq!(
            response,
            Body::SetResult(SetResult {
                bus: 1,
                dev: 3,
                par: 7,
                value: 99,
                requested: 99,
                mirror: true,
            })
        );
    }

    #[test]
    fn test_parse_read_error_responses() {
        let cases = [
            ("ERR:NO RESP!", ErrorKind::NoResponse),
            ("ERR:ADDR USED TWICE!", ErrorKind::AddressConflict),
            ("ERROR!", ErrorKind::Unknown),
        ];
        for (line, kind) in cases {
            let mut parser = ReplyParser::new();
            parser.set_request(Body::read(0, 0, 0, false));
            let response = parse_all(&mut parser, &[line]);
            match response {
                Body::Error(e) => assert_eq!(e.kind(), kind),
                other => panic!("unexpected response {}", other.type_name()),
            }
        }
    }

    #[test]
    fn test_parse_garbage_read_line_is_parse_error() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::read(0, 0, 0, false));
        let response = parse_all(&mut parser, &["XX what"]);
        match response {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::ParseError),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }

    #[test]
    fn test_parse_scanbus_with_address_conflict() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::Scanbus(ScanbusRequest { bus: 0 }));

        let mut lines = vec![
            "ID-SCAN BUS 0:".to_string(),
            "0: -".to_string(),
            "1: 17, ON".to_string(),
            "ERR:ADDR".to_string(),
            "2: 21, ON".to_string(),
        ];
        for i in 3..16 {
            lines.push(format!("{i}: -"));
        }
        let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let response = parse_all(&mut parser, &line_refs);

        let Body::ScanbusResult(result) = response else {
            panic!("expected scanbus result");
        };
        assert_eq!(result.bus, 0);
        assert_eq!(result.entries.len(), 16);
        assert_eq!(result.entries[0].idc, 0);
        assert_eq!(result.entries[0].rc_state(), RcState::Off);
        assert_eq!(result.entries[1].idc, 17);
        assert_eq!(result.entries[1].rc_state(), RcState::On);
        assert_eq!(result.entries[2].idc, 21);
        assert_eq!(result.entries[2].rc_state(), RcState::AddressConflict);
        for entry in &result.entries[3..] {
            assert_eq!(entry.idc, 0);
            assert_eq!(entry.rc_state(), RcState::Off);
        }
    }

    #[test]
    fn test_parse_scanbus_conflict_on_last_slot_still_completes() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::Scanbus(ScanbusRequest { bus: 1 }));

        assert!(!parser.parse_line("ID-SCAN BUS 1:"));
        for i in 0..15 {
            assert!(!parser.parse_line(&format!("{i}: -")));
        }
        assert!(!parser.parse_line("ERR:ADDR"));
        assert!(parser.parse_line("15: 4, ON"));

        let Body::ScanbusResult(result) = parser.take_response() else {
            panic!("expected scanbus result");
        };
        assert_eq!(result.entries[15].rc_state(), RcState::AddressConflict);
    }

    #[test]
    fn test_parse_scanbus_rejects_letter_o_off() {
        // The device emits "0FF" with a digit zero; the letter form is not
        // part of the grammar and must not parse as a slot line.
        let mut parser = ReplyParser::new();
        parser.set_request(Body::Scanbus(ScanbusRequest { bus: 0 }));
        assert!(!parser.parse_line("ID-SCAN BUS 0:"));
        assert!(parser.parse_line("3: 17, OFF"));
        match parser.take_response() {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::ParseError),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }

    #[test]
    fn test_parse_scanbus_accepts_digit_zero_off() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::Scanbus(ScanbusRequest { bus: 0 }));
        assert!(!parser.parse_line("ID-SCAN BUS 0:"));
        assert!(!parser.parse_line("0: 17, 0FF"));
        // Continue to completion.
        for i in 1..15 {
            assert!(!parser.parse_line(&format!("{i}: -")));
        }
        assert!(parser.parse_line("15: -"));
        let Body::ScanbusResult(result) = parser.take_response() else {
            panic!("expected scanbus result");
        };
        assert_eq!(result.entries[0].idc, 17);
        assert_eq!(result.entries[0].rc_state(), RcState::Off);
    }

    #[test]
    fn test_parse_scanbus_body_without_header_resyncs() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::Scanbus(ScanbusRequest { bus: 0 }));

        // Body line for slot 12 without a header: 3 more lines get consumed.
        assert!(!parser.parse_line("12: 17, ON"));
        assert!(!parser.parse_line("13: -"));
        assert!(!parser.parse_line("14: -"));
        assert!(parser.parse_line("15: -"));
        match parser.take_response() {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::ParseError),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }

    #[test]
    fn test_parse_read_multi() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::ReadMulti(ReadMultiRequest {
            bus: 0,
            dev: 1,
            par: 32,
            count: 3,
        }));
        let response = parse_all(&mut parser, &["100", "-2", "300"]);
        assert_eq!(
            response,
            Body::ReadMultiResult(ReadMultiResult {
                bus: 0,
                dev: 1,
                par: 32,
                values: vec![100, -2, 300],
            })
        );
    }

    #[test]
    fn test_parse_read_multi_single_value() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::ReadMulti(ReadMultiRequest {
            bus: 0,
            dev: 0,
            par: 0,
            count: 1,
        }));
        let response = parse_all(&mut parser, &["7"]);
        match response {
            Body::ReadMultiResult(r) => assert_eq!(r.values, vec![7]),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }

    #[test]
    fn test_parse_read_multi_non_numeric_line_resyncs() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::ReadMulti(ReadMultiRequest {
            bus: 0,
            dev: 0,
            par: 0,
            count: 3,
        }));
        assert!(!parser.parse_line("100"));
        assert!(!parser.parse_line("bogus"));
        // One remaining line is swallowed before completion.
        assert!(parser.parse_line("300"));
        match parser.take_response() {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::ParseError),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }

    #[test]
    fn test_parse_read_multi_bad_last_line_completes_immediately() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::ReadMulti(ReadMultiRequest {
            bus: 0,
            dev: 0,
            par: 0,
            count: 1,
        }));
        assert!(parser.parse_line("bogus"));
        match parser.take_response() {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::ParseError),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }

    #[test]
    fn test_parse_rc_reset_copy() {
        for request in [
            Body::Rc(crate::protocol::message::RcRequest {
                bus: 0,
                dev: 1,
                on: true,
            }),
            Body::Reset(crate::protocol::message::ResetRequest { bus: 0, dev: 1 }),
            Body::Copy(crate::protocol::message::CopyRequest { bus: 0, dev: 1 }),
        ] {
            let mut parser = ReplyParser::new();
            parser.set_request(request);
            let response = parse_all(&mut parser, &["ON 0 1"]);
            assert_eq!(response, Body::bool_response(true));
        }
    }

    #[test]
    fn test_parse_rc_error_consumes_follow_up_line() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::Rc(crate::protocol::message::RcRequest {
            bus: 0,
            dev: 1,
            on: true,
        }));
        assert!(!parser.parse_line("ERR:NO RESP!"));
        assert!(parser.parse_line("mumble"));
        match parser.take_response() {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::NoResponse),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }

    #[test]
    fn test_non_command_request_yields_unknown_error() {
        let mut parser = ReplyParser::new();
        parser.set_request(Body::bool_response(true));
        assert!(parser.parse_line("whatever"));
        match parser.take_response() {
            Body::Error(e) => assert_eq!(e.kind(), ErrorKind::Unknown),
            other => panic!("unexpected response {}", other.type_name()),
        }
    }
}
