//! IRC Wire Parsing
//!
//! Turns raw IRC lines into [`IrcEvent`] values and provides the DCC/CTCP
//! grammar helpers: quote-aware argument splitting, peer address decoding,
//! filename validation, the XDCC announcement dialect and the
//! send→ssend rewrite rule.

use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::LazyLock;

/// Parsed IRC event, dispatched by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcEvent {
    /// 001 RPL_WELCOME
    Welcome,
    /// 900 RPL_LOGGEDIN (NickServ/SASL login success)
    LoggedIn,
    /// Server keep-alive
    Ping { token: String },
    Join { nick: String, channel: String },
    Part { nick: String, channel: String },
    Kick { channel: String, target: String },
    /// 474 ERR_BANNEDFROMCHAN
    BannedFromChan { channel: String },
    /// 477 ERR_NOCHANMODES
    NoChanModes { channel: String },
    /// CTCP payload extracted from a PRIVMSG or NOTICE
    Ctcp { from: String, payload: String },
    /// Plain PRIVMSG/NOTICE text
    Privmsg { from: String, text: String },
}

/// Parse one IRC line (without the trailing CRLF) into an event.
///
/// Lines the session has no handler for return `None`.
pub fn parse_line(line: &str) -> Option<IrcEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }

    let (prefix, rest) = if let Some(stripped) = line.strip_prefix(':') {
        let (prefix, rest) = stripped.split_once(' ')?;
        (Some(prefix), rest)
    } else {
        (None, line)
    };

    let (command, params) = split_params(rest);
    let nick = prefix.map(nick_of).unwrap_or_default();

    match command {
        "PING" => Some(IrcEvent::Ping {
            token: params.first().cloned().unwrap_or_default(),
        }),
        "001" => Some(IrcEvent::Welcome),
        "900" => Some(IrcEvent::LoggedIn),
        // Numeric replies carry our own nick as the first parameter.
        "474" => Some(IrcEvent::BannedFromChan {
            channel: params.get(1)?.clone(),
        }),
        "477" => Some(IrcEvent::NoChanModes {
            channel: params.get(1)?.clone(),
        }),
        "JOIN" => Some(IrcEvent::Join {
            nick,
            channel: params.first()?.clone(),
        }),
        "PART" => Some(IrcEvent::Part {
            nick,
            channel: params.first()?.clone(),
        }),
        "KICK" => Some(IrcEvent::Kick {
            channel: params.first()?.clone(),
            target: params.get(1)?.clone(),
        }),
        "PRIVMSG" | "NOTICE" => {
            let text = params.get(1)?;
            if let Some(payload) = unwrap_ctcp(text) {
                Some(IrcEvent::Ctcp {
                    from: nick,
                    payload: payload.to_string(),
                })
            } else {
                Some(IrcEvent::Privmsg {
                    from: nick,
                    text: text.clone(),
                })
            }
        }
        _ => None,
    }
}

/// Split "COMMAND arg1 arg2 :trailing with spaces" into command + params.
fn split_params(rest: &str) -> (&str, Vec<String>) {
    let (command, args) = match rest.split_once(' ') {
        Some((c, a)) => (c, a),
        None => return (rest, Vec::new()),
    };

    let mut params = Vec::new();
    let mut remaining = args;
    loop {
        if let Some(trailing) = remaining.strip_prefix(':') {
            params.push(trailing.to_string());
            break;
        }
        match remaining.split_once(' ') {
            Some((param, rest)) => {
                if !param.is_empty() {
                    params.push(param.to_string());
                }
                remaining = rest;
            }
            None => {
                if !remaining.is_empty() {
                    params.push(remaining.to_string());
                }
                break;
            }
        }
    }
    (command, params)
}

/// Extract the nickname from an IRC prefix ("nick!user@host").
fn nick_of(prefix: &str) -> String {
    prefix.split('!').next().unwrap_or(prefix).to_string()
}

/// Unwrap a \x01-framed CTCP message, returning the inner payload.
fn unwrap_ctcp(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('\x01')?;
    Some(inner.strip_suffix('\x01').unwrap_or(inner).trim())
}

/// Split a DCC payload into arguments with shell-style quoting: segments may
/// be wrapped in single or double quotes to protect embedded whitespace.
pub fn split_dcc_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        args.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

/// Decode a DCC peer address: a 32-bit integer or dotted IPv4, or a textual
/// IPv6 address.
pub fn parse_peer_address(raw: &str) -> Option<IpAddr> {
    if raw.contains(':') {
        return raw.parse::<Ipv6Addr>().ok().map(IpAddr::V6);
    }
    if let Ok(n) = raw.parse::<u32>() {
        return Some(IpAddr::V4(Ipv4Addr::from(n)));
    }
    raw.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
}

/// Private/loopback/link-local/ULA check used by the offer policy.
pub fn is_private_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            // fc00::/7 unique-local, fe80::/10 link-local
            v6.is_loopback() || (seg0 & 0xfe00) == 0xfc00 || (seg0 & 0xffc0) == 0xfe80
        }
    }
}

/// Validate a filename received in a DCC offer.
///
/// A filename is valid if it is non-empty, contains none of
/// `/ \ : * ? " < > |`, and resolves to a path inside the download directory.
pub fn is_valid_filename(download_dir: &Path, filename: &str) -> bool {
    if filename.is_empty() || filename == "." || filename == ".." {
        return false;
    }
    if filename
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
    {
        return false;
    }
    download_dir.join(filename).starts_with(download_dir)
}

static DCC_ACCEPT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) (\d+)$").unwrap());

/// Parse the port and resume position from a `DCC ACCEPT` payload.
pub fn parse_dcc_accept(payload: &str) -> Option<(u64, u64)> {
    let caps = DCC_ACCEPT_RE.captures(payload)?;
    let port = caps[1].parse().ok()?;
    let position = caps[2].parse().ok()?;
    Some((port, position))
}

/// Raw (unvalidated) arguments of a DCC SEND/SSEND payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DccSendArgs {
    pub filename: String,
    pub address: String,
    pub port: String,
    pub size: String,
}

/// Split a `SEND <quoted-filename> <addr> <port> <size>` payload. Policy
/// validation happens in the session; this only enforces the argument count.
pub fn parse_dcc_send_args(payload: &str) -> Option<DccSendArgs> {
    let parts = split_dcc_args(payload);
    if parts.len() < 5 {
        return None;
    }
    Some(DccSendArgs {
        filename: parts[1].clone(),
        address: parts[2].clone(),
        port: parts[3].clone(),
        size: parts[4].clone(),
    })
}

static PACK_ANNOUNCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^\*\* Sending you pack #(\d+) \("([^"]+)"\).+, MD5:([a-f0-9]{32})"#).unwrap()
});

static TRANSFER_COMPLETED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\* Transfer Completed.+ md5sum: ([a-f0-9]{32})").unwrap());

static SEND_DENIED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^XDCC SEND denied, (.+)").unwrap());

static XDCC_REQUEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^xdcc (send|batch) ").unwrap());

/// Match the "** Sending you pack #N ("FILE") [..., MD5:...]" announcement
/// dialect. Returns `(filename, md5)`.
pub fn parse_pack_announcement(text: &str) -> Option<(String, String)> {
    let caps = PACK_ANNOUNCE_RE.captures(text)?;
    Some((caps[2].to_string(), caps[3].to_string()))
}

/// Match the "** Transfer Completed ... md5sum: ..." notice. Returns the md5.
pub fn parse_transfer_completed(text: &str) -> Option<String> {
    let caps = TRANSFER_COMPLETED_RE.captures(text)?;
    Some(caps[1].to_string())
}

/// Match the "XDCC SEND denied, <reason>" error reply.
pub fn parse_send_denied(text: &str) -> Option<String> {
    let caps = SEND_DENIED_RE.captures(text)?;
    Some(caps[1].to_string())
}

/// Rewrite an outbound "xdcc send"/"xdcc batch" request to its TLS form
/// ("xdcc ssend"/"xdcc sbatch"). Returns `None` when the message is not an
/// xdcc request; whether the rewrite applies at all is the caller's decision.
pub fn rewrite_xdcc_request(message: &str) -> Option<String> {
    let caps = XDCC_REQUEST_RE.captures(message)?;
    let keyword = caps.get(1).unwrap();
    Some(format!(
        "xdcc s{}{}",
        keyword.as_str().to_lowercase(),
        &message[keyword.end()..]
    ))
}

/// Normalize a channel name: trim, lowercase, ensure a leading '#'.
pub fn normalize_channel(channel: &str) -> String {
    let normalized = channel.trim().to_lowercase();
    if normalized.is_empty() || normalized.starts_with('#') {
        normalized
    } else {
        format!("#{}", normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_welcome() {
        let event = parse_line(":irc.example.net 001 mynick :Welcome to the network").unwrap();
        assert_eq!(event, IrcEvent::Welcome);
    }

    #[test]
    fn test_parse_loggedin() {
        let event =
            parse_line(":irc.example.net 900 mynick mynick!u@h acct :You are now logged in")
                .unwrap();
        assert_eq!(event, IrcEvent::LoggedIn);
    }

    #[test]
    fn test_parse_ping() {
        let event = parse_line("PING :irc.example.net").unwrap();
        assert_eq!(
            event,
            IrcEvent::Ping {
                token: "irc.example.net".to_string()
            }
        );
    }

    #[test]
    fn test_parse_join_part_kick() {
        assert_eq!(
            parse_line(":mynick!user@host JOIN :#chan").unwrap(),
            IrcEvent::Join {
                nick: "mynick".to_string(),
                channel: "#chan".to_string()
            }
        );
        assert_eq!(
            parse_line(":mynick!user@host PART #chan :bye").unwrap(),
            IrcEvent::Part {
                nick: "mynick".to_string(),
                channel: "#chan".to_string()
            }
        );
        assert_eq!(
            parse_line(":op!user@host KICK #chan mynick :spam").unwrap(),
            IrcEvent::Kick {
                channel: "#chan".to_string(),
                target: "mynick".to_string()
            }
        );
    }

    #[test]
    fn test_parse_numeric_replies() {
        assert_eq!(
            parse_line(":irc.example.net 474 mynick #closed :Cannot join channel (+b)").unwrap(),
            IrcEvent::BannedFromChan {
                channel: "#closed".to_string()
            }
        );
        assert_eq!(
            parse_line(":irc.example.net 477 mynick #regonly :You need a registered nick").unwrap(),
            IrcEvent::NoChanModes {
                channel: "#regonly".to_string()
            }
        );
    }

    #[test]
    fn test_parse_privmsg_and_ctcp() {
        assert_eq!(
            parse_line(":bot!u@h PRIVMSG mynick :hello there").unwrap(),
            IrcEvent::Privmsg {
                from: "bot".to_string(),
                text: "hello there".to_string()
            }
        );
        assert_eq!(
            parse_line(":bot!u@h PRIVMSG mynick :\x01DCC SEND \"f\" 1 2 3\x01").unwrap(),
            IrcEvent::Ctcp {
                from: "bot".to_string(),
                payload: "DCC SEND \"f\" 1 2 3".to_string()
            }
        );
        // CTCP may also arrive NOTICE-framed (ctcp replies)
        assert!(matches!(
            parse_line(":bot!u@h NOTICE mynick :\x01DCC ACCEPT f 6000 500\x01").unwrap(),
            IrcEvent::Ctcp { .. }
        ));
    }

    #[test]
    fn test_parse_unknown_line() {
        assert!(parse_line(":irc.example.net 372 mynick :- motd line").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn test_split_dcc_args() {
        assert_eq!(
            split_dcc_args("SEND \"two words.bin\" 2130706433 5000 1024"),
            vec!["SEND", "two words.bin", "2130706433", "5000", "1024"]
        );
        assert_eq!(
            split_dcc_args("SEND plain.bin 2130706433 5000 1024"),
            vec!["SEND", "plain.bin", "2130706433", "5000", "1024"]
        );
        assert_eq!(split_dcc_args("  a  b "), vec!["a", "b"]);
        assert_eq!(split_dcc_args("'quoted arg' x"), vec!["quoted arg", "x"]);
    }

    #[test]
    fn test_parse_dcc_send_args() {
        let args = parse_dcc_send_args("SEND \"file.bin\" 2130706433 5000 1024").unwrap();
        assert_eq!(args.filename, "file.bin");
        assert_eq!(args.address, "2130706433");
        assert_eq!(args.port, "5000");
        assert_eq!(args.size, "1024");

        assert!(parse_dcc_send_args("SEND file.bin 2130706433 5000").is_none());
    }

    #[test]
    fn test_parse_peer_address() {
        assert_eq!(
            parse_peer_address("2130706433").unwrap(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            parse_peer_address("1.2.3.4").unwrap(),
            "1.2.3.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            parse_peer_address("2001:db8::1").unwrap(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
        assert!(parse_peer_address("not-an-ip").is_none());
        assert!(parse_peer_address("99999999999999999999").is_none());
    }

    #[test]
    fn test_is_private_ip() {
        for addr in ["10.0.0.1", "192.168.1.1", "172.16.0.1", "127.0.0.1", "169.254.0.1", "::1", "fc00::1", "fe80::1"] {
            assert!(is_private_ip(&addr.parse().unwrap()), "{}", addr);
        }
        for addr in ["8.8.8.8", "1.2.3.4", "2001:db8::1"] {
            assert!(!is_private_ip(&addr.parse().unwrap()), "{}", addr);
        }
    }

    #[test]
    fn test_is_valid_filename() {
        let dir = PathBuf::from("/downloads");
        assert!(is_valid_filename(&dir, "file.bin"));
        assert!(is_valid_filename(&dir, "some long name.tar.gz"));
        assert!(!is_valid_filename(&dir, ""));
        assert!(!is_valid_filename(&dir, ".."));
        assert!(!is_valid_filename(&dir, "../etc/passwd"));
        assert!(!is_valid_filename(&dir, "a/b"));
        assert!(!is_valid_filename(&dir, "a\\b"));
        for c in [':', '*', '?', '"', '<', '>', '|'] {
            assert!(!is_valid_filename(&dir, &format!("bad{}name", c)));
        }
        // idempotent: validating a valid name twice changes nothing
        assert!(is_valid_filename(&dir, "file.bin") && is_valid_filename(&dir, "file.bin"));
    }

    #[test]
    fn test_parse_dcc_accept() {
        assert_eq!(
            parse_dcc_accept("ACCEPT \"foo\" 6000 500").unwrap(),
            (6000, 500)
        );
        assert_eq!(parse_dcc_accept("ACCEPT foo 6000 500").unwrap(), (6000, 500));
        assert!(parse_dcc_accept("ACCEPT foo").is_none());
    }

    #[test]
    fn test_parse_pack_announcement() {
        let (filename, md5) = parse_pack_announcement(
            "** Sending you pack #1 (\"TEST.mkv\") [1.0GB, MD5:82ce0f4fe6e5c862d54dae475b8a1b82] - (resume+ssl supported)",
        )
        .unwrap();
        assert_eq!(filename, "TEST.mkv");
        assert_eq!(md5, "82ce0f4fe6e5c862d54dae475b8a1b82");

        assert!(parse_pack_announcement("** Sending you pack #1 (\"x\") no md5 here").is_none());
        assert!(parse_pack_announcement("unrelated notice").is_none());
    }

    #[test]
    fn test_parse_transfer_completed() {
        assert_eq!(
            parse_transfer_completed(
                "** Transfer Completed (1.0GB in 60s) md5sum: 82ce0f4fe6e5c862d54dae475b8a1b82"
            )
            .unwrap(),
            "82ce0f4fe6e5c862d54dae475b8a1b82"
        );
        assert!(parse_transfer_completed("** Transfer Completed, no checksum").is_none());
    }

    #[test]
    fn test_parse_send_denied() {
        assert_eq!(
            parse_send_denied("XDCC SEND denied, you must be on a known channel").unwrap(),
            "you must be on a known channel"
        );
        assert!(parse_send_denied("XDCC SEND ok").is_none());
    }

    #[test]
    fn test_rewrite_xdcc_request() {
        assert_eq!(
            rewrite_xdcc_request("xdcc send #5").unwrap(),
            "xdcc ssend #5"
        );
        assert_eq!(
            rewrite_xdcc_request("xdcc batch 1-3").unwrap(),
            "xdcc sbatch 1-3"
        );
        // any input case maps to a valid lowercase request, remainder untouched
        assert_eq!(
            rewrite_xdcc_request("XDCC SEND #5").unwrap(),
            "xdcc ssend #5"
        );
        assert_eq!(
            rewrite_xdcc_request("Xdcc Batch 1-3").unwrap(),
            "xdcc sbatch 1-3"
        );
        assert!(rewrite_xdcc_request("xdcc ssend #5").is_none());
        assert!(rewrite_xdcc_request("xdcc info #5").is_none());
        assert!(rewrite_xdcc_request("hello").is_none());
    }

    #[test]
    fn test_normalize_channel() {
        assert_eq!(normalize_channel("Chan"), "#chan");
        assert_eq!(normalize_channel("#Chan"), "#chan");
        assert_eq!(normalize_channel("  #chan  "), "#chan");
        assert_eq!(normalize_channel(""), "");
    }
}
