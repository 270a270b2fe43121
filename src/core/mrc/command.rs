//! MRC ASCII command rendering
//!
//! Every MRC-bound request maps to one command line: decimal fields, single
//! spaces, terminated by a bare `\r`. The mirror flag on read/set selects
//! the `RM`/`SM` opcodes addressing the device's mirror memory region.

use crate::protocol::message::Body;

/// Terminator appended to every command line
pub const COMMAND_TERMINATOR: char = '\r';

/// Render the command string for an MRC-bound request, without the
/// terminator. Returns `None` for anything that is not an MRC command.
pub fn render(body: &Body) -> Option<String> {
    let s = match body {
        Body::Scanbus(r) => format!("SC {}", r.bus),
        Body::Rc(r) if r.on => format!("ON {} {}", r.bus, r.dev),
        Body::Rc(r) => format!("OFF {} {}", r.bus, r.dev),
        Body::Reset(r) => format!("RST {} {}", r.bus, r.dev),
        Body::Copy(r) => format!("CP {} {}", r.bus, r.dev),
        Body::Read(r) if r.mirror => format!("RM {} {} {}", r.bus, r.dev, r.par),
        Body::Read(r) => format!("RE {} {} {}", r.bus, r.dev, r.par),
        Body::Set(r) if r.mirror => format!("SM {} {} {} {}", r.bus, r.dev, r.par, r.value),
        Body::Set(r) => format!("SE {} {} {} {}", r.bus, r.dev, r.par, r.value),
        Body::ReadMulti(r) => format!("RB {} {} {} {}", r.bus, r.dev, r.par, r.count),
        _ => return None,
    };
    Some(s)
}

/// Render including the `\r` terminator, ready for the byte link
pub fn render_line(body: &Body) -> Option<String> {
    render(body).map(|mut s| {
        s.push(COMMAND_TERMINATOR);
        s
    })
}
