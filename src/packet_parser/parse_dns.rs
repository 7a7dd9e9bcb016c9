/// Extract the query name from a DNS message payload.
///
/// Only the common single-question case is handled due to ambiguity in the
/// current IETF standard; messages with no parseable question yield `None`.
/// Works for both queries and responses since the question section is echoed
/// in answers.
pub fn query_name(packet: &[u8], logger: &slog::Logger) -> Option<String> {
    let parsed_message = match domain::base::message::Message::from_octets(packet) {
        Ok(message) => message,
        Err(e) => {
            slog::debug!(logger, "DNS payload failed to parse"; "error" => e.to_string());
            return None;
        }
    };

    let question = parsed_message.first_question()?;
    slog::debug!(logger, "parsed a DNS question {:?}", question);

    let mut name = question.qname().to_string();
    // Drop the trailing root label so downstream keyword matching sees the
    // bare hostname form.
    if name.ends_with('.') {
        name.pop();
    }
    if name.is_empty() {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::query_name;

    const TEST_DNS_QUERY_PAYLOAD: &str =
        "e54201000001000000000000047863626403636f6d0000010001";
    const TEST_DNS_A_RESPONSE_PAYLOAD: &str = "c87f8180000100040000000004786b636403636f6d0000010001c00c0001000100000c97000497650043c00c0001000100000c97000497654043c00c0001000100000c97000497658043c00c0001000100000c9700049765c043";
    const TEST_DNS_BROKEN_PAYLOAD: &str = "9af181800001000400000000046f637370";

    fn decode_hex(input: &str) -> Result<Vec<u8>, std::num::ParseIntError> {
        (0..input.len())
            .step_by(2)
            .map(|chunk_i| u8::from_str_radix(&input[chunk_i..chunk_i + 2], 16))
            .collect()
    }

    fn make_logger() -> slog::Logger {
        use slog::*;
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();

        slog::Logger::root(drain, o!())
    }

    #[test]
    fn test_query_name_from_query() {
        let log = make_logger();
        let data = decode_hex(TEST_DNS_QUERY_PAYLOAD).unwrap();
        assert_eq!(query_name(&data, &log), Some("xcbd.com".to_owned()));
    }

    #[test]
    fn test_query_name_from_response() {
        let log = make_logger();
        let data = decode_hex(TEST_DNS_A_RESPONSE_PAYLOAD).unwrap();
        assert_eq!(query_name(&data, &log), Some("xkcd.com".to_owned()));
    }

    #[test]
    fn test_broken_payload() {
        let log = make_logger();
        let data = decode_hex(TEST_DNS_BROKEN_PAYLOAD).unwrap();
        assert_eq!(query_name(&data, &log), None);
    }
}
