// TLS record and handshake framing constants. Only the initial ClientHello
// is inspected; every other record type is ignored.
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_TYPE_HOSTNAME: u8 = 0x00;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

/// Extract the SNI hostname from a TLS ClientHello at the start of a TCP
/// payload. Returns `None` for anything that is not a well-formed
/// ClientHello carrying a server_name extension.
pub fn server_name(payload: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(payload);

    // TLSPlaintext record header.
    if cursor.u8()? != RECORD_TYPE_HANDSHAKE {
        return None;
    }
    cursor.skip(2)?; // legacy record version
    let record_len = cursor.u16()? as usize;
    let record = Cursor::new(cursor.take(record_len.min(payload.len() - cursor.pos))?);
    let mut hs = record;

    // Handshake header.
    if hs.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }
    let body_len =
        u32::from_be_bytes([0, hs.u8()?, hs.u8()?, hs.u8()?]) as usize;
    let mut body = Cursor::new(hs.take(body_len.min(hs.data.len() - hs.pos))?);

    body.skip(2)?; // client_version
    body.skip(32)?; // random
    let session_id_len = body.u8()? as usize;
    body.skip(session_id_len)?;
    let cipher_suites_len = body.u16()? as usize;
    body.skip(cipher_suites_len)?;
    let compression_len = body.u8()? as usize;
    body.skip(compression_len)?;

    let extensions_len = body.u16()? as usize;
    let mut extensions = Cursor::new(body.take(extensions_len)?);
    while extensions.pos < extensions.data.len() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext_data = extensions.take(ext_len)?;
        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }
        let mut sni = Cursor::new(ext_data);
        let list_len = sni.u16()? as usize;
        let mut names = Cursor::new(sni.take(list_len)?);
        while names.pos < names.data.len() {
            let name_type = names.u8()?;
            let name_len = names.u16()? as usize;
            let name = names.take(name_len)?;
            if name_type == SNI_TYPE_HOSTNAME && !name.is_empty() {
                return std::str::from_utf8(name)
                    .ok()
                    .map(|s| s.to_ascii_lowercase());
            }
        }
        return None;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::server_name;

    // Assemble a minimal ClientHello record carrying the given extensions.
    fn client_hello(extensions: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version TLS1.2
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id
        body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn sni_extension(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut entry = vec![0x00]; // host_name type
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name);

        let mut ext = Vec::new();
        ext.extend_from_slice(&0u16.to_be_bytes()); // server_name extension
        ext.extend_from_slice(&((entry.len() + 2) as u16).to_be_bytes());
        ext.extend_from_slice(&(entry.len() as u16).to_be_bytes());
        ext.extend_from_slice(&entry);
        ext
    }

    #[test]
    fn test_extract_sni() {
        let hello = client_hello(&sni_extension("www.Example.NET"));
        assert_eq!(server_name(&hello), Some("www.example.net".to_owned()));
    }

    #[test]
    fn test_sni_after_other_extensions() {
        let mut extensions = Vec::new();
        // supported_versions extension first.
        extensions.extend_from_slice(&0x002bu16.to_be_bytes());
        extensions.extend_from_slice(&3u16.to_be_bytes());
        extensions.extend_from_slice(&[0x02, 0x03, 0x04]);
        extensions.extend_from_slice(&sni_extension("cdn.example.com"));
        let hello = client_hello(&extensions);
        assert_eq!(server_name(&hello), Some("cdn.example.com".to_owned()));
    }

    #[test]
    fn test_no_sni_extension() {
        let hello = client_hello(&[]);
        assert_eq!(server_name(&hello), None);
    }

    #[test]
    fn test_not_a_client_hello() {
        // Application data record.
        let payload = [0x17, 0x03, 0x03, 0x00, 0x05, 1, 2, 3, 4, 5];
        assert_eq!(server_name(&payload), None);
    }

    #[test]
    fn test_truncated_hello() {
        let mut hello = client_hello(&sni_extension("example.com"));
        hello.truncate(40);
        assert_eq!(server_name(&hello), None);
    }
}
