use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use domain::base::ToDname;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Hostname {0} did not resolve to any IPv4 address")]
    NoAddresses(String),
    #[error("Malformed hostname {0}")]
    BadHostname(String),
    #[error("DNS I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves blocked hostnames to their current IPv4 sets.
///
/// Two independent methods are used and their results unioned: the system
/// resolver via `lookup_host`, and a direct UDP query against the local
/// recursive resolver. CDN-heavy domains answer differently per query, so
/// the union catches addresses either method alone would miss. IPv6
/// addresses are dropped; the forward chains are IPv4-only.
pub struct Resolver {
    resolver_addr: SocketAddr,
    timeout: std::time::Duration,
    log: slog::Logger,
}

impl Resolver {
    pub fn new(
        resolver_addr: SocketAddr,
        timeout: std::time::Duration,
        log: slog::Logger,
    ) -> Resolver {
        Resolver {
            resolver_addr,
            timeout,
            log,
        }
    }

    pub async fn resolve_ipv4(&self, hostname: &str) -> Result<BTreeSet<Ipv4Addr>, ResolveError> {
        let mut addresses = BTreeSet::new();

        // Method 1: the system resolver, for the bare name and the www
        // variant. Failures here are soft; the direct query may still hit.
        for candidate in name_variants(hostname) {
            match self.lookup_host_ipv4(&candidate).await {
                Ok(found) => addresses.extend(found),
                Err(e) => {
                    slog::debug!(self.log, "system resolution failed";
                        "hostname" => &candidate, "error" => e.to_string());
                }
            }
        }

        // Method 2: direct query to the local recursive resolver.
        match self.query_local_resolver(hostname).await {
            Ok(found) => addresses.extend(found),
            Err(e) => {
                slog::debug!(self.log, "direct resolution failed";
                    "hostname" => hostname, "error" => e.to_string());
            }
        }

        if addresses.is_empty() {
            return Err(ResolveError::NoAddresses(hostname.to_owned()));
        }
        Ok(addresses)
    }

    async fn lookup_host_ipv4(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let lookup = tokio::net::lookup_host((hostname, 443));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "resolution timed out")
            })??;
        Ok(addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }

    async fn query_local_resolver(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let absolute = if hostname.ends_with('.') {
            hostname.to_owned()
        } else {
            format!("{}.", hostname)
        };
        let dname = domain::base::Dname::<Bytes>::from_chars(absolute.chars())
            .map_err(|_| ResolveError::BadHostname(hostname.to_owned()))?;

        let mut builder = domain::base::MessageBuilder::new_vec();
        builder.header_mut().set_id(rand::random());
        builder.header_mut().set_rd(true);
        let mut question = builder.question();
        question
            .push((&dname, domain::base::Rtype::A))
            .map_err(|_| ResolveError::BadHostname(hostname.to_owned()))?;
        let query = question.finish();

        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.resolver_addr).await?;
        socket.send(&query).await?;

        let mut buffer = vec![0u8; 4096];
        let received = tokio::time::timeout(self.timeout, socket.recv(&mut buffer))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "resolver did not answer")
            })??;
        buffer.truncate(received);

        Ok(parse_a_answers(&dname, &buffer))
    }
}

fn name_variants(hostname: &str) -> Vec<String> {
    let mut variants = vec![hostname.to_owned()];
    if !hostname.starts_with("www.") {
        variants.push(format!("www.{}", hostname));
    }
    variants
}

// Walk the answer section collecting A records, following CNAME
// indirection. Anything unparseable yields the records collected so far.
fn parse_a_answers(query_name: &domain::base::Dname<Bytes>, packet: &[u8]) -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    let parsed_message = match domain::base::message::Message::from_octets(packet) {
        Ok(message) => message,
        Err(_) => return addresses,
    };
    let answer_section = match parsed_message.answer() {
        Ok(section) => section,
        Err(_) => return addresses,
    };

    let mut current_canonical_name = query_name.to_bytes();
    for record in answer_section.limit_to_in::<domain::rdata::AllRecordData<_, _>>() {
        let answer = match record {
            Ok(answer) => answer,
            Err(_) => break,
        };
        if answer.owner().to_bytes().ne(&current_canonical_name) {
            continue;
        }
        match answer.data() {
            domain::rdata::AllRecordData::A(parsed_answer) => {
                addresses.push(parsed_answer.addr());
            }
            domain::rdata::AllRecordData::Cname(parsed_answer) => {
                current_canonical_name = parsed_answer.cname().to_bytes();
            }
            _ => continue,
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DNS_A_PAYLOAD: &str = "c87f8180000100040000000004786b636403636f6d0000010001c00c0001000100000c97000497650043c00c0001000100000c97000497654043c00c0001000100000c97000497658043c00c0001000100000c9700049765c043";
    const TEST_DNS_CNAME_PAYLOAD: &str = "9af181800001000400000000046f6373700a676c6f62616c7369676e03636f6d0000010001c00c000500010000545d001106676c6f62616c037072640363646ec011c0310005000100000333002a0363646e0d676c6f62616c7369676e63646e03636f6d0363646e0a636c6f7564666c617265036e657400c04e000100010000012b0004681215e2c04e000100010000012b0004681214e2";

    fn decode_hex(input: &str) -> Result<Vec<u8>, std::num::ParseIntError> {
        (0..input.len())
            .step_by(2)
            .map(|chunk_i| u8::from_str_radix(&input[chunk_i..chunk_i + 2], 16))
            .collect()
    }

    #[test]
    fn test_parse_a_answers() {
        let data = decode_hex(TEST_DNS_A_PAYLOAD).unwrap();
        let name = domain::base::Dname::<Bytes>::from_chars("xkcd.com.".chars()).unwrap();
        let addresses = parse_a_answers(&name, &data);
        assert_eq!(
            addresses,
            vec![
                "151.101.0.67".parse::<Ipv4Addr>().unwrap(),
                "151.101.64.67".parse().unwrap(),
                "151.101.128.67".parse().unwrap(),
                "151.101.192.67".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_a_answers_follows_cname() {
        let data = decode_hex(TEST_DNS_CNAME_PAYLOAD).unwrap();
        let name =
            domain::base::Dname::<Bytes>::from_chars("ocsp.globalsign.com.".chars()).unwrap();
        let addresses = parse_a_answers(&name, &data);
        assert_eq!(
            addresses,
            vec![
                "104.18.21.226".parse::<Ipv4Addr>().unwrap(),
                "104.18.20.226".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_broken_payload() {
        let data = decode_hex("9af181800001000400000000046f637370").unwrap();
        let name = domain::base::Dname::<Bytes>::from_chars("ocsp.com.".chars()).unwrap();
        assert!(parse_a_answers(&name, &data).is_empty());
    }

    #[test]
    fn test_name_variants() {
        assert_eq!(
            name_variants("example.net"),
            vec!["example.net".to_owned(), "www.example.net".to_owned()]
        );
        assert_eq!(name_variants("www.example.net").len(), 1);
    }
}
