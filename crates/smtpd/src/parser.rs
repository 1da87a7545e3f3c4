use std::net::{IpAddr, SocketAddr};

/// ESMTP keyword parameter as it appears after the path on MAIL FROM
/// and RCPT TO. Names are normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom {
        address: String,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: String,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Help,
    StartTls,
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// Attribute name/value pairs, names normalized to upper case.
    Xclient(Vec<(String, String)>),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            if line.len() < candidate.len() {
                false
            } else {
                line[..candidate.len()].eq_ignore_ascii_case(candidate)
            }
        }

        fn extract_envelope(line: &str) -> Result<(&str, &str), String> {
            let line = line.trim_start();
            if !line.starts_with('<') {
                return Err(format!("expected <: {line:?}"));
            }
            let rangle = line
                .bytes()
                .position(|c| c == b'>')
                .ok_or_else(|| format!("expected >: {line:?}"))?;

            Ok((&line[1..rangle], &line[rangle + 1..]))
        }

        fn extract_parameters(text: &str) -> Vec<EsmtpParameter> {
            text.split_ascii_whitespace()
                .map(|field| {
                    let mut parts = field.splitn(2, '=');
                    EsmtpParameter {
                        name: parts.next().unwrap_or("").to_ascii_uppercase(),
                        value: parts.next().map(|value| value.to_string()),
                    }
                })
                .collect()
        }

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("STARTTLS") {
            Self::StartTls
        } else if line.eq_ignore_ascii_case("NOOP") || prefix_match(line, "NOOP ") {
            Self::Noop
        } else if line.eq_ignore_ascii_case("HELP") || prefix_match(line, "HELP ") {
            Self::Help
        } else if line.eq_ignore_ascii_case("VRFY") {
            Self::Vrfy(String::new())
        } else if prefix_match(line, "VRFY ") {
            Self::Vrfy(line[5..].trim().to_string())
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo(line[5..].trim().to_string())
        } else if prefix_match(line, "HELO ") {
            Self::Helo(line[5..].trim().to_string())
        } else if prefix_match(line, "MAIL FROM:") {
            let (address, params) = extract_envelope(&line[10..])?;
            Self::MailFrom {
                address: address.to_string(),
                parameters: extract_parameters(params),
            }
        } else if prefix_match(line, "RCPT TO:") {
            let (address, params) = extract_envelope(&line[8..])?;
            if address.is_empty() {
                return Err("Null sender not permitted as a recipient".to_string());
            }
            Self::RcptTo {
                address: address.to_string(),
                parameters: extract_parameters(params),
            }
        } else if prefix_match(line, "AUTH ") {
            let mut fields = line[5..].trim().splitn(2, ' ');
            let mechanism = fields.next().unwrap_or("").to_ascii_uppercase();
            if mechanism.is_empty() {
                return Err("missing authentication mechanism".to_string());
            }
            let initial_response = fields
                .next()
                .map(|response| response.trim().to_string())
                .filter(|response| !response.is_empty());
            Self::Auth {
                mechanism,
                initial_response,
            }
        } else if prefix_match(line, "XCLIENT ") {
            let mut attrs = vec![];
            for field in line[8..].split_ascii_whitespace() {
                let mut parts = field.splitn(2, '=');
                let name = parts.next().unwrap_or("").to_ascii_uppercase();
                let value = parts
                    .next()
                    .ok_or_else(|| format!("malformed XCLIENT attribute: {field}"))?;
                attrs.push((name, value.to_string()));
            }
            if attrs.is_empty() {
                return Err("XCLIENT requires at least one attribute".to_string());
            }
            Self::Xclient(attrs)
        } else {
            Self::Unknown(line.to_string())
        })
    }

    /// Commands that may be issued before the session is upgraded when
    /// TLS is being enforced.
    pub fn allowed_before_tls(&self) -> bool {
        matches!(
            self,
            Self::Ehlo(_) | Self::Helo(_) | Self::Noop | Self::StartTls | Self::Quit | Self::Rset
        )
    }
}

/// Parse a HAProxy PROXY protocol v1 header and return the original
/// source address it reports.
pub fn parse_proxy_header(line: &str) -> Result<SocketAddr, String> {
    let mut fields = line.split_ascii_whitespace();
    if fields.next() != Some("PROXY") {
        return Err(format!("expected PROXY: {line:?}"));
    }

    let family = fields.next().ok_or("missing protocol family")?;
    if family != "TCP4" && family != "TCP6" {
        return Err(format!("unsupported protocol family {family}"));
    }

    let src_ip: IpAddr = fields
        .next()
        .ok_or("missing source address")?
        .parse()
        .map_err(|_| "invalid source address".to_string())?;
    let dst_ip: IpAddr = fields
        .next()
        .ok_or("missing destination address")?
        .parse()
        .map_err(|_| "invalid destination address".to_string())?;
    let src_port: u16 = fields
        .next()
        .ok_or("missing source port")?
        .parse()
        .map_err(|_| "invalid source port".to_string())?;
    let _dst_port: u16 = fields
        .next()
        .ok_or("missing destination port")?
        .parse()
        .map_err(|_| "invalid destination port".to_string())?;

    if fields.next().is_some() {
        return Err(format!("trailing data: {line:?}"));
    }
    let is_tcp4 = family == "TCP4";
    if is_tcp4 != src_ip.is_ipv4() || is_tcp4 != dst_ip.is_ipv4() {
        return Err(format!("{family} does not match the reported addresses"));
    }

    Ok(SocketAddr::new(src_ip, src_port))
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn command_parser() {
        assert_equal!(Command::parse("QUIT").unwrap(), Command::Quit);
        assert_equal!(Command::parse("quit").unwrap(), Command::Quit);
        assert_equal!(
            Command::parse("quite").unwrap(),
            Command::Unknown("quite".to_string())
        );
        assert_equal!(
            Command::parse("flibble").unwrap(),
            Command::Unknown("flibble".to_string())
        );
        assert_equal!(Command::parse("starttls").unwrap(), Command::StartTls);
        assert_equal!(Command::parse("NOOP ignored").unwrap(), Command::Noop);
        assert_equal!(
            Command::parse("EHLO client.example.com").unwrap(),
            Command::Ehlo("client.example.com".to_string())
        );
        assert_equal!(
            Command::parse("MAIL From:<>").unwrap(),
            Command::MailFrom {
                address: String::new(),
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("MAIL From:<user@example.com>").unwrap(),
            Command::MailFrom {
                address: "user@example.com".to_string(),
                parameters: vec![],
            }
        );
        assert_equal!(
            Command::parse("rcpt to:<>").unwrap_err(),
            "Null sender not permitted as a recipient".to_string()
        );
        assert_equal!(
            Command::parse("rcpt TO:<user@example.com>").unwrap(),
            Command::RcptTo {
                address: "user@example.com".to_string(),
                parameters: vec![],
            }
        );
    }

    #[test]
    fn mail_from_with_parameters() {
        assert_equal!(
            Command::parse("MAIL FROM:<user@example.com> SIZE=1000 BODY=8BITMIME").unwrap(),
            Command::MailFrom {
                address: "user@example.com".to_string(),
                parameters: vec![
                    EsmtpParameter {
                        name: "SIZE".to_string(),
                        value: Some("1000".to_string()),
                    },
                    EsmtpParameter {
                        name: "BODY".to_string(),
                        value: Some("8BITMIME".to_string()),
                    },
                ],
            }
        );
        // A space between the colon and the path is tolerated.
        assert_equal!(
            Command::parse("MAIL FROM: <user@example.com>").unwrap(),
            Command::MailFrom {
                address: "user@example.com".to_string(),
                parameters: vec![],
            }
        );
    }

    #[test]
    fn auth_commands() {
        assert_equal!(
            Command::parse("AUTH PLAIN AGZvbwBiYXI=").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial_response: Some("AGZvbwBiYXI=".to_string()),
            }
        );
        assert_equal!(
            Command::parse("AUTH login").unwrap(),
            Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial_response: None,
            }
        );
    }

    #[test]
    fn xclient_attributes() {
        assert_equal!(
            Command::parse("XCLIENT ADDR=192.0.2.1 PORT=4242 proto=ESMTP").unwrap(),
            Command::Xclient(vec![
                ("ADDR".to_string(), "192.0.2.1".to_string()),
                ("PORT".to_string(), "4242".to_string()),
                ("PROTO".to_string(), "ESMTP".to_string()),
            ])
        );
        assert!(Command::parse("XCLIENT ADDR").is_err());
    }

    #[test]
    fn proxy_header() {
        assert_equal!(
            parse_proxy_header("PROXY TCP4 192.0.2.1 198.51.100.1 56324 25").unwrap(),
            "192.0.2.1:56324".parse::<SocketAddr>().unwrap()
        );
        assert_equal!(
            parse_proxy_header("PROXY TCP6 2001:db8::1 2001:db8::2 4242 25").unwrap(),
            "[2001:db8::1]:4242".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_proxy_header("PROXY UNKNOWN").is_err());
        assert!(parse_proxy_header("PROXY TCP4 2001:db8::1 2001:db8::2 1 2").is_err());
        assert!(parse_proxy_header("PROXY TCP4 192.0.2.1 not-an-ip 56324 25").is_err());
        assert!(parse_proxy_header("PROXY TCP4 192.0.2.1 198.51.100.1 56324 not-a-port").is_err());
        assert!(parse_proxy_header("PROXY TCP4 192.0.2.1 2001:db8::2 56324 25").is_err());
        assert!(parse_proxy_header("EHLO club.example.com").is_err());
        assert!(parse_proxy_header("PROXY TCP4 192.0.2.1 198.51.100.1 56324 25 junk").is_err());
    }

    #[test]
    fn tls_gate_allows_the_session_prelude() {
        assert!(Command::parse("EHLO e").unwrap().allowed_before_tls());
        assert!(Command::parse("STARTTLS").unwrap().allowed_before_tls());
        assert!(Command::parse("QUIT").unwrap().allowed_before_tls());
        assert!(!Command::parse("MAIL FROM:<a@x>")
            .unwrap()
            .allowed_before_tls());
        assert!(!Command::parse("DATA").unwrap().allowed_before_tls());
    }
}
