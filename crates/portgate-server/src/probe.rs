//! Ports-in-use probe
//!
//! Samples the OS for endpoints that are listening (TCP state LISTEN) or
//! bound without connection state (UDP), the set a fresh bind would collide
//! with. On Linux this reads the procfs socket tables.

use portgate_proto::Protocol;
use std::collections::HashSet;
use std::io;

/// TCP socket state `LISTEN` in procfs
const TCP_STATE_LISTEN: u8 = 0x0a;

/// Ports currently busy for the given protocol
pub fn list_busy_ports(protocol: Protocol) -> io::Result<HashSet<u16>> {
    match protocol {
        Protocol::Tcp => busy_ports_from(&["/proc/net/tcp", "/proc/net/tcp6"], true),
        Protocol::Udp => busy_ports_from(&["/proc/net/udp", "/proc/net/udp6"], false),
        Protocol::TcpUdp => {
            let mut ports = list_busy_ports(Protocol::Tcp)?;
            ports.extend(list_busy_ports(Protocol::Udp)?);
            Ok(ports)
        }
    }
}

fn busy_ports_from(tables: &[&str], listen_only: bool) -> io::Result<HashSet<u16>> {
    let mut ports = HashSet::new();
    for table in tables {
        let content = match std::fs::read_to_string(table) {
            Ok(content) => content,
            // dual-stack tables may be absent (e.g. ipv6 disabled)
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        parse_socket_table(&content, listen_only, &mut ports)?;
    }
    Ok(ports)
}

/// Parse one procfs socket table. Lines look like
/// `0: 0100007F:1F90 00000000:0000 0A ...` where the local address is
/// `hexip:hexport` and the state is a hex byte.
fn parse_socket_table(
    content: &str,
    listen_only: bool,
    ports: &mut HashSet<u16>,
) -> io::Result<()> {
    for line in content.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _sl = fields.next();
        let local = match fields.next() {
            Some(local) => local,
            None => continue,
        };
        let _remote = fields.next();
        let state = match fields.next() {
            Some(state) => state,
            None => continue,
        };

        if listen_only {
            let state = u8::from_str_radix(state, 16)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if state != TCP_STATE_LISTEN {
                continue;
            }
        }

        let port_hex = match local.rsplit_once(':') {
            Some((_, port_hex)) => port_hex,
            None => continue,
        };
        let port = u16::from_str_radix(port_hex, 16)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if port != 0 {
            ports.insert(port);
        }
    }
    Ok(())
}
