use async_trait::async_trait;

/// Abstract bidirectional IPv4 packet device. The concrete kernel driver
/// (tun fd, VpnService fd, packet tunnel provider) is an OS-specific
/// collaborator supplied by the embedder; the data plane only needs whole
/// packets in and out.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Reads one IP packet into `buf`, returning its length.
    async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Writes one IP packet.
    async fn write_packet(&self, packet: &[u8]) -> std::io::Result<usize>;

    fn name(&self) -> &str;

    fn mtu(&self) -> u16;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex;

    /// In-memory device: packets pushed into `inbound_tx` come out of
    /// `read_packet`, packets the handler writes show up on `outbound_rx`.
    pub struct ChannelDevice {
        pub inbound_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        pub outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl ChannelDevice {
        pub fn new() -> (
            Self,
            mpsc::UnboundedSender<Vec<u8>>,
            mpsc::UnboundedReceiver<Vec<u8>>,
        ) {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            (
                Self {
                    inbound_rx: Mutex::new(inbound_rx),
                    outbound_tx,
                },
                inbound_tx,
                outbound_rx,
            )
        }
    }

    #[async_trait]
    impl PacketDevice for ChannelDevice {
        async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.inbound_rx.lock().await.recv().await {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        async fn write_packet(&self, packet: &[u8]) -> std::io::Result<usize> {
            let _ = self.outbound_tx.send(packet.to_vec());
            Ok(packet.len())
        }

        fn name(&self) -> &str {
            "test0"
        }

        fn mtu(&self) -> u16 {
            1500
        }
    }
}
