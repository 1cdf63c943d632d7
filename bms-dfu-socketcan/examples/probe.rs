//! Prints what a station on `can0` reports about itself.
//!
//! cargo run --example probe -- [address]

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    use bms_dfu::{Client, ClientConfig};
    use bms_dfu_socketcan::Interface;

    let address = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 0,
    };

    let mut client = Client::new(Interface::new(), ClientConfig::default());
    client.connect(0, 500_000)?;
    println!("{}", client.device_info()?);

    let cells = client.prepare(address)?;
    println!("station {address}: {cells} cells");
    println!("bootloader {}", client.bootloader_version(address)?);
    println!("application {}", client.application_version(address)?);
    println!("hardware {}", client.hardware_info(address)?);
    println!("battery {}", client.battery_serial_number(address)?);

    client.disconnect()?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() -> anyhow::Result<()> {
    anyhow::bail!("SocketCAN is only available on Linux")
}
