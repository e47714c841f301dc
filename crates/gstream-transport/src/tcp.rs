//! TCP transport, used by the external test harness
//! (`GFXSTREAM_TRANSPORT=tcp`, `VIRTGPU_KUMQUAT=1` setups).

use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::pipe::PipeStream;
use crate::TransportError;

pub fn connect(addr: impl ToSocketAddrs) -> Result<PipeStream<TcpStream>, TransportError> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    Ok(PipeStream::new(stream))
}

/// Accept a single session. One guest process per connection.
pub fn accept(listener: &TcpListener) -> Result<PipeStream<TcpStream>, TransportError> {
    let (stream, _peer) = listener.accept()?;
    stream.set_nodelay(true)?;
    Ok(PipeStream::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Channel;

    #[test]
    fn loopback_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let mut host = accept(&listener).unwrap();
            let mut buf = [0u8; 5];
            host.read_fully(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            host.write_bytes(b"ok").unwrap();
            host.flush().unwrap();
        });

        let mut guest = connect(addr).unwrap();
        guest.write_bytes(b"hello").unwrap();
        guest.flush().unwrap();
        let mut reply = [0u8; 2];
        guest.read_fully(&mut reply).unwrap();
        assert_eq!(&reply, b"ok");
        server.join().expect("server panicked");
    }
}
