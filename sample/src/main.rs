use anyhow::{anyhow, Result};
use bluetooth_communicator::transport::TcpTransport;
use bluetooth_communicator::{
    delivery_queue, BluetoothClient, BluetoothServer, ConnectOutcome, DeliveryContext, ListenEvent,
    PeerId, SendOutcome, Transport,
};
use btcomm_shared::{DEFAULT_SERVICE_NAME, SAMPLE_SERVICE_UUID};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
usage:
  btcomm-sample server [bind-address]     listen over TCP (default 127.0.0.1:9000)
  btcomm-sample client <host:port>        connect over TCP
  btcomm-sample bt-server                 listen over Bluetooth RFCOMM (feature rfcomm)
  btcomm-sample bt-client <XX:XX:..:XX>   connect over Bluetooth RFCOMM (feature rfcomm)
  btcomm-sample bt-scan                   list paired and nearby devices (feature rfcomm)";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = args.first().map(String::as_str).unwrap_or("");

    // Every library callback runs here, one at a time
    let (queue, delivery_loop) = delivery_queue();
    tokio::spawn(delivery_loop.run());
    let delivery: Arc<dyn DeliveryContext> = Arc::new(queue);

    match mode {
        "server" => {
            let bind = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1:9000".into());
            run_server(TcpTransport::new(bind), delivery).await
        }
        "client" => {
            let peer = args.get(1).ok_or_else(|| anyhow!("missing peer address\n{}", USAGE))?;
            run_client(TcpTransport::default(), delivery, PeerId::from(peer.as_str())).await
        }
        #[cfg(feature = "rfcomm")]
        "bt-server" => {
            let transport = bt::transport().await?;
            run_server(transport, delivery).await
        }
        #[cfg(feature = "rfcomm")]
        "bt-client" => {
            let peer = args.get(1).ok_or_else(|| anyhow!("missing device address\n{}", USAGE))?;
            let transport = bt::transport().await?;
            run_client(transport, delivery, PeerId::from(peer.as_str())).await
        }
        #[cfg(feature = "rfcomm")]
        "bt-scan" => bt::scan(delivery).await,
        _ => {
            eprintln!("{}", USAGE);
            Ok(())
        }
    }
}

async fn run_server<T: Transport>(transport: T, delivery: Arc<dyn DeliveryContext>) -> Result<()> {
    let server = BluetoothServer::new(transport, delivery);
    print_incoming(&server);

    let (failed_tx, failed_rx) = oneshot::channel();
    let failed_tx = std::sync::Mutex::new(Some(failed_tx));
    server
        .start_listening(DEFAULT_SERVICE_NAME, SAMPLE_SERVICE_UUID, move |event| match event {
            ListenEvent::Accepted(peer) => println!("* {} connected", peer),
            ListenEvent::Failed { reason } => {
                if let Some(tx) = failed_tx.lock().ok().and_then(|mut tx| tx.take()) {
                    let _ = tx.send(reason);
                }
            }
        })
        .await;

    // Wait until the listen outcome is known before reading stdin
    tokio::select! {
        reason = failed_rx => {
            if let Ok(reason) = reason {
                return Err(anyhow!("Could not listen: {}", reason));
            }
        }
        _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
    }
    info!("Type a line to send it to every connected peer, Ctrl-D to quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        if server.connection_count().await == 0 {
            warn!("No peers connected");
            continue;
        }
        let report: bluetooth_communicator::OnSend = Arc::new(report_send);
        server.send_line_to_all(&line, Some(report)).await;
    }

    server.stop_listening();
    server.disconnect_all().await;
    Ok(())
}

async fn run_client<T: Transport>(
    transport: T,
    delivery: Arc<dyn DeliveryContext>,
    peer: PeerId,
) -> Result<()> {
    let client = BluetoothClient::new(transport, delivery);
    print_incoming(&client);

    let (result_tx, result_rx) = oneshot::channel();
    client
        .connect_to(peer.clone(), SAMPLE_SERVICE_UUID, move |outcome| {
            let _ = result_tx.send(outcome);
        })
        .await;

    match result_rx.await? {
        ConnectOutcome::Succeeded(peer) => println!("* connected to {}", peer),
        ConnectOutcome::Failed { peer, reason } => {
            return Err(anyhow!("Could not connect to {}: {}", peer, reason));
        }
    }
    info!("Type a line to send it, Ctrl-D to quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        if !client.is_connected_to(&peer).await {
            error!("Connection to {} is gone", peer);
            break;
        }
        let report: bluetooth_communicator::OnSend = Arc::new(report_send);
        client.send_line(&line, &peer, Some(report)).await;
    }

    client.disconnect(&peer).await;
    Ok(())
}

fn print_incoming(communicator: &bluetooth_communicator::BluetoothCommunicator) {
    communicator.set_on_receive(|line, peer| println!("{}: {}", peer, line));
    communicator.set_on_lose_connection(|peer| println!("* lost connection to {}", peer));
}

fn report_send(outcome: SendOutcome) {
    if let SendOutcome::Failed { peer, reason } = outcome {
        warn!("Send to {} failed: {}", peer, reason);
    }
}

#[cfg(feature = "rfcomm")]
mod bt {
    use super::*;
    use bluetooth_communicator::transport::{DiscoveryConfig, RfcommConfig, RfcommTransport};
    use bluetooth_communicator::BluetoothAdapter;
    use std::time::Duration;

    pub async fn transport() -> Result<RfcommTransport> {
        let adapter = BluetoothAdapter::open().await?;
        adapter.request_enable().await?;
        RfcommTransport::new(RfcommConfig {
            discovery: DiscoveryConfig {
                scan_duration: Some(Duration::from_secs(10)),
            },
            ..Default::default()
        })
        .await
    }

    pub async fn scan(delivery: Arc<dyn DeliveryContext>) -> Result<()> {
        let client = BluetoothClient::new(transport().await?, delivery);

        for device in client.paired_devices().await? {
            println!(
                "paired  {}  {}",
                device.peer,
                device.name.as_deref().unwrap_or("(unnamed)")
            );
        }

        client.start_discovery(|device| {
            println!(
                "nearby  {}  {}",
                device.peer,
                device.name.as_deref().unwrap_or("(unnamed)")
            );
        });
        while client.is_discovering() {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Ok(())
    }
}
