//! The fixed hyperstart control-channel command vocabulary.
//!
//! hyperstart command bodies themselves are opaque JSON payloads to this
//! proxy; only the name → numeric code mapping and the small set of
//! terminator codes (`READY`/`ACK`/`ERROR`/`NEXT`) are meaningful here.
//! Codes must stay in sync with hyperstart's own `src/api.h`.

/// Inbound/outbound control codes the proxy itself interprets directly.
pub const INIT_READY: u32 = 8;
pub const INIT_ACK: u32 = 9;
pub const INIT_ERROR: u32 = 10;
pub const INIT_NEXT: u32 = 14;

/// Maps a `hyperName` from a client's `hyper` request onto its numeric
/// control code, or `None` if the name isn't part of the fixed vocabulary.
pub fn code_for_command(name: &str) -> Option<u32> {
    let code = match name {
        "version" => 0,
        "startpod" => 1,
        "getpod" => 2,
        "destroypod" => 4,
        "restartcontainer" => 5,
        "execcmd" => 6,
        "finishcmd" => 7,
        "ready" => INIT_READY,
        "ack" => INIT_ACK,
        "error" => INIT_ERROR,
        "winsize" => 11,
        "ping" => 12,
        "finishpod" => 13,
        "next" => INIT_NEXT,
        "newcontainer" => 17,
        "killcontainer" => 18,
        "onlinecpumem" => 19,
        "setupinterface" => 20,
        "setuproute" => 21,
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_resolve() {
        assert_eq!(code_for_command("ping"), Some(12));
        assert_eq!(code_for_command("startpod"), Some(1));
    }

    #[test]
    fn unknown_command_is_none() {
        assert_eq!(code_for_command("writefile"), None);
        assert_eq!(code_for_command("bogus"), None);
    }

    #[test]
    fn codes_are_pairwise_distinct() {
        let names = [
            "version",
            "startpod",
            "getpod",
            "destroypod",
            "restartcontainer",
            "execcmd",
            "finishcmd",
            "ready",
            "ack",
            "error",
            "winsize",
            "ping",
            "finishpod",
            "next",
            "newcontainer",
            "killcontainer",
            "onlinecpumem",
            "setupinterface",
            "setuproute",
        ];
        let mut codes: Vec<u32> = names.iter().map(|n| code_for_command(n).unwrap()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), names.len());
    }
}
