//! Event loop echo: a client thread sends attribute messages over a socket
//! pair; the loop decodes each one, logs it as JSON and echoes it back.
//!
//! Run with:
//!   UBOXPRIMS_LOG=debug cargo run --example echo-loop

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use uboxprims::blob::{Attr, Buffer};
use uboxprims::event::{EventLoop, Ready, TimerAction, WatchFlags};
use uboxprims::logging::init_logging_from_env;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env();

    let (mut client, server) = UnixStream::pair()?;
    let mut event_loop = EventLoop::new();
    event_loop.init()?;
    let handle = event_loop.handle()?;

    handle.register(OwnedFd::from(server), WatchFlags::READ, |h, id, ready| {
        if ready.contains(Ready::HANGUP) {
            eprintln!("Client hung up");
            let _ = h.deregister(id);
            h.end();
            return;
        }

        let message = match h.read(id) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("Read failed: {e}");
                return;
            }
        };
        match Attr::parse(&message).and_then(|head| head.to_json_text(true)) {
            Ok(json) => eprintln!("Received {} bytes: {json}", message.len()),
            Err(e) => eprintln!("Undecodable message: {e}"),
        }
        if let Err(e) = h.write(id, &message) {
            eprintln!("Echo failed: {e}");
        }
    })?;

    // Give up if the client stalls.
    handle.set_timeout(Duration::from_secs(5), |h, _| {
        eprintln!("Timed out");
        h.end();
        TimerAction::Done
    })?;

    let sender = std::thread::spawn(move || -> Result<(), String> {
        for seq in 0..3u32 {
            let mut message = Buffer::new();
            message.add_u32("seq", seq).map_err(|e| e.to_string())?;
            message
                .add_json_str(r#"{"hello":"world","tags":["a","b"]}"#)
                .map_err(|e| e.to_string())?;
            client.write_all(message.as_bytes()).map_err(|e| e.to_string())?;

            let mut echoed = vec![0u8; message.len()];
            client.read_exact(&mut echoed).map_err(|e| e.to_string())?;
            assert_eq!(echoed, message.as_bytes());
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    });

    event_loop.run()?;
    sender
        .join()
        .map_err(|_| "sender thread panicked")?
        .map_err(|e| format!("sender failed: {e}"))?;
    event_loop.done()?;
    Ok(())
}
