use std::io::{self, Read, Write};
use std::sync::Arc;
use std::{env, fs, thread};

use usbacm::xhci::XhciDevice;
use usbacm::{CdcAcm, Notification, SessionConfig, SessionEvent};

fn main() {
    let mut args = env::args().skip(1);

    const USAGE: &'static str = "usbacmd <scheme> <port> [config.toml]";

    let scheme = args.next().expect(USAGE);
    let port = args.next().expect(USAGE);
    let config_path = args.next();

    let name = format!("{}_{}_acm", scheme, port);
    common::setup_logging(
        "usb",
        "device",
        &name,
        common::output_level("USBACMD_LOG"),
        common::file_level(),
    );

    log::info!(
        "USB CDC-ACM driver spawned with scheme `{}`, port {}",
        scheme,
        port
    );

    let mut config = match config_path {
        Some(path) => {
            let text = fs::read_to_string(&path).expect("Failed to read configuration");
            SessionConfig::from_toml(&text).expect("Failed to parse configuration")
        }
        None => SessionConfig::default(),
    };
    config.name.get_or_insert(name);

    let device = XhciDevice::open(scheme, port).expect("Failed to read configuration descriptor");
    let session = Arc::new(CdcAcm::open(Arc::new(device), config).expect("Failed to open session"));

    let input = Arc::clone(&session);
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 512];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    if let Err(err) = input.write(&buf[..len]) {
                        log::warn!("{}: {}", input.name(), err);
                        break;
                    }
                }
                Err(err) => {
                    log::error!("{}: failed to read stdin: {}", input.name(), err);
                    break;
                }
            }
        }
        input.destroy();
    });

    let mut stdout = io::stdout();
    while let Some(event) = session.next_event() {
        match event {
            SessionEvent::Ready { confirmed } => {
                log::info!("{}: ready, line coding {:?}", session.name(), confirmed)
            }
            SessionEvent::Data(data) => {
                if let Err(err) = stdout.write_all(&data).and_then(|()| stdout.flush()) {
                    log::error!("{}: failed to write stdout: {}", session.name(), err);
                    session.destroy();
                }
            }
            SessionEvent::Status(bytes) => match Notification::parse(&bytes) {
                Some(notification) => log::info!("{}: {:?}", session.name(), notification),
                None => log::debug!("{}: status {:02x?}", session.name(), bytes),
            },
            SessionEvent::WriteComplete { id, result } => {
                if let Err(err) = result {
                    log::warn!("{}: write {:?} failed: {}", session.name(), id, err);
                }
            }
            SessionEvent::Error(err) => log::warn!("{}: {}", session.name(), err),
            SessionEvent::Closed(result) => {
                match result {
                    Ok(()) => log::info!("{}: closed", session.name()),
                    Err(err) => log::error!("{}: closed with error: {}", session.name(), err),
                }
                break;
            }
        }
    }
}
