//! Wire vocabulary: command and reply byte codes.
//!
//! The sequence number and the frame boundaries travel in the frame header;
//! these codes are the first byte of every request and every non-empty reply.

/// Echo a string back.
pub const CMD_PING: i8 = 0;
/// Invoke a service function.
pub const CMD_INVOKE: i8 = 1;
/// End the session after this exchange.
pub const CMD_QUIT: i8 = 2;
/// Drop one reference to an exposed object.
pub const CMD_DECREF: i8 = 3;
/// Add one reference to an exposed object.
pub const CMD_INCREF: i8 = 4;
/// Version negotiation. Reserved for interoperability; not served here.
pub const CMD_HANDSHAKE: i8 = 5;

pub const REPLY_SUCCESS: i8 = 0;
pub const REPLY_PROTOCOL_ERROR: i8 = 1;
pub const REPLY_PACKED_EXCEPTION: i8 = 2;
pub const REPLY_GENERIC_EXCEPTION: i8 = 3;

/// Magic value opening a handshake.
pub const PROTOCOL_MAGIC: u32 = 0x5AF3_0CF7;

/// Human-readable name of a command code, for logs.
pub fn command_name(code: i8) -> &'static str {
    match code {
        CMD_PING => "PING",
        CMD_INVOKE => "INVOKE",
        CMD_QUIT => "QUIT",
        CMD_DECREF => "DECREF",
        CMD_INCREF => "INCREF",
        CMD_HANDSHAKE => "HANDSHAKE",
        _ => "UNKNOWN",
    }
}

/// Human-readable name of a reply code, for logs.
pub fn reply_name(code: i8) -> &'static str {
    match code {
        REPLY_SUCCESS => "SUCCESS",
        REPLY_PROTOCOL_ERROR => "PROTOCOL_ERROR",
        REPLY_PACKED_EXCEPTION => "PACKED_EXCEPTION",
        REPLY_GENERIC_EXCEPTION => "GENERIC_EXCEPTION",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_contract() {
        assert_eq!(
            [CMD_PING, CMD_INVOKE, CMD_QUIT, CMD_DECREF, CMD_INCREF, CMD_HANDSHAKE],
            [0, 1, 2, 3, 4, 5]
        );
        assert_eq!(
            [
                REPLY_SUCCESS,
                REPLY_PROTOCOL_ERROR,
                REPLY_PACKED_EXCEPTION,
                REPLY_GENERIC_EXCEPTION
            ],
            [0, 1, 2, 3]
        );
        assert_eq!(PROTOCOL_MAGIC, 0x5af30cf7);
    }

    #[test]
    fn unknown_codes_have_a_name() {
        assert_eq!(command_name(99), "UNKNOWN");
        assert_eq!(reply_name(-1), "UNKNOWN");
        assert_eq!(command_name(CMD_DECREF), "DECREF");
    }
}
