//! Blocking usage, without an async runtime of your own.

use std::time::Duration;

use aqmp::legacy::{QemuMonitorProtocol, Wait};

fn main() -> aqmp::Result<()> {
    let endpoint = QemuMonitorProtocol::parse_address("127.0.0.1:4444")?;
    let mut qmp = QemuMonitorProtocol::new(endpoint, false, Some("legacy".into()))?;
    qmp.set_timeout(Some(Duration::from_secs(10)));

    qmp.connect(true)?;
    println!("{}", qmp.command("query-status", None)?);

    qmp.command("stop", None)?;
    if let Some(event) = qmp.pull_event(Wait::Timeout(Duration::from_secs(5)))? {
        println!("{event}");
    }
    qmp.command("cont", None)?;

    qmp.close()
}
