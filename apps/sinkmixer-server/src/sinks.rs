//! Builds the `NetworkSender` a sink's configured `ProtocolVariant` calls
//! for. Codec-backed variants (Opus, WebRTC) need a real external codec or
//! data channel, which this standalone demo host does not embed -- those
//! variants return an error here rather than pretending to work.

use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, Result};
use sinkmixer_core::sender::multi_device::MultiDeviceRtpSender;
use sinkmixer_core::sender::rtp_l16::RtpL16Sender;
use sinkmixer_core::sender::scream::ScreamLegacySender;
use sinkmixer_core::sender::system_audio::SystemAudioSender;
use sinkmixer_core::{NetworkSender, ProtocolVariant, SharedContext, SinkConfig};

/// Constructs the `NetworkSender` for `sink`, allocating a fresh SSRC from
/// `context` for RTP-based variants.
pub fn build_sender(sink: &SinkConfig, context: &SharedContext) -> Result<Box<dyn NetworkSender>> {
    let source_ip = match sink.output_ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(anyhow!("sink '{}': IPv6 output_ip is not supported", sink.sink_id)),
    };
    let destination = SocketAddr::new(sink.output_ip, sink.output_port);

    match sink.protocol_variant {
        ProtocolVariant::ScreamLegacy => Ok(Box::new(ScreamLegacySender::new(
            destination,
            sink.output_sample_rate,
            sink.output_bit_depth,
            sink.output_channels,
            sink.channel_layout_mask,
        ))),

        ProtocolVariant::RtpL16 => {
            let ssrc = context.allocate_ssrc();
            Ok(Box::new(RtpL16Sender::new(
                destination,
                sink.sink_id.clone(),
                source_ip,
                ssrc,
                sinkmixer_core::mixer::downscale::bytes_per_sample(sink.output_bit_depth),
                sink.output_channels,
                sink.output_sample_rate,
                sink.channel_layout_mask,
                sink.time_sync_delay_ms,
            )))
        }

        ProtocolVariant::MultiDeviceRtpL16 => {
            let ssrc_base = context.allocate_ssrc();
            Ok(Box::new(MultiDeviceRtpSender::new_l16(
                sink.sink_id.clone(),
                source_ip,
                ssrc_base,
                sink.output_channels,
                sink.output_sample_rate,
                sinkmixer_core::mixer::downscale::bytes_per_sample(sink.output_bit_depth),
                sink.time_sync_delay_ms,
                sink.rtp_receivers.clone(),
            )))
        }

        ProtocolVariant::SystemAudio => Ok(Box::new(SystemAudioSender::new(
            sink.sink_id.clone(),
            sink.output_ip,
            sink.output_sample_rate,
            sink.output_channels,
            sink.output_bit_depth,
            format!("/tmp/sinkmixer-{}.pcm", sink.sink_id),
        ))),

        ProtocolVariant::RtpOpus | ProtocolVariant::MultiDeviceRtpOpus => Err(anyhow!(
            "sink '{}': {:?} requires an Opus encoder, which this demo host does not embed; \
             provide one via a host integration that constructs the sender directly",
            sink.sink_id,
            sink.protocol_variant
        )),

        ProtocolVariant::WebRtcDataChannel => Err(anyhow!(
            "sink '{}': WebRtcDataChannel requires a negotiated data channel from a host \
             runtime, which this demo host does not embed",
            sink.sink_id
        )),
    }
}
