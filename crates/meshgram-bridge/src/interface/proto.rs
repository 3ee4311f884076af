//! Meshtastic protobuf messages
//!
//! Only the subset of the Meshtastic schema the bridge reads or writes is
//! declared here, with field tags matching the upstream `.proto` files.
//! Fields and oneof variants not listed are skipped by the decoder.

#![allow(missing_docs)]

/// `PortNum.TEXT_MESSAGE_APP`
pub const PORTNUM_TEXT_MESSAGE: i32 = 1;

/// `PortNum.ADMIN_APP`
pub const PORTNUM_ADMIN: i32 = 6;

/// Packet from the client to the radio
#[derive(Clone, PartialEq, prost::Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "1")]
        Packet(super::MeshPacket),
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

/// Keep-alive sent to the radio
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Heartbeat {}

/// Packet from the radio to the client
#[derive(Clone, PartialEq, prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(oneof = "from_radio::PayloadVariant", tags = "2, 3, 4, 5, 7")]
    pub payload_variant: Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "2")]
        Packet(super::MeshPacket),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(message, tag = "4")]
        NodeInfo(super::NodeInfo),
        #[prost(message, tag = "5")]
        Config(super::Config),
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    #[prost(uint32, tag = "19")]
    pub relay_node: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: Option<mesh_packet::PayloadVariant>,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes, tag = "5")]
        Encrypted(Vec<u8>),
    }
}

/// Decoded application payload
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(int32, tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(uint32, optional, tag = "9")]
    pub hops_away: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Config {
    #[prost(oneof = "config::PayloadVariant", tags = "6")]
    pub payload_variant: Option<config::PayloadVariant>,
}

pub mod config {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "6")]
        Lora(super::LoRaConfig),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoRaConfig {
    #[prost(bool, tag = "1")]
    pub use_preset: bool,
    #[prost(int32, tag = "2")]
    pub modem_preset: i32,
    #[prost(uint32, tag = "3")]
    pub bandwidth: u32,
    #[prost(uint32, tag = "4")]
    pub spread_factor: u32,
    #[prost(uint32, tag = "5")]
    pub coding_rate: u32,
    #[prost(float, tag = "6")]
    pub frequency_offset: f32,
    #[prost(int32, tag = "7")]
    pub region: i32,
    #[prost(uint32, tag = "8")]
    pub hop_limit: u32,
    #[prost(bool, tag = "9")]
    pub tx_enabled: bool,
    #[prost(int32, tag = "10")]
    pub tx_power: i32,
    #[prost(uint32, tag = "11")]
    pub channel_num: u32,
    #[prost(bool, tag = "12")]
    pub override_duty_cycle: bool,
    #[prost(bool, tag = "13")]
    pub sx126x_rx_boosted_gain: bool,
    #[prost(float, tag = "14")]
    pub override_frequency: f32,
    #[prost(bool, tag = "15")]
    pub pa_fan_disabled: bool,
    #[prost(uint32, repeated, tag = "103")]
    pub ignore_incoming: Vec<u32>,
    #[prost(bool, tag = "104")]
    pub ignore_mqtt: bool,
    #[prost(bool, tag = "105")]
    pub config_ok_to_mqtt: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AdminMessage {
    #[prost(oneof = "admin_message::PayloadVariant", tags = "34")]
    pub payload_variant: Option<admin_message::PayloadVariant>,
}

pub mod admin_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "34")]
        SetConfig(super::Config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_text_packet_wire_tags() {
        let packet = MeshPacket {
            from: 0x0102_0304,
            to: 0xFFFF_FFFF,
            id: 7,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
                portnum: PORTNUM_TEXT_MESSAGE,
                payload: b"hi".to_vec(),
                ..Default::default()
            })),
            ..Default::default()
        };
        let bytes = packet.encode_to_vec();

        // field 1, wire type 5 (fixed32)
        assert_eq!(bytes[0], 0x0D);
        assert_eq!(&bytes[1..5], &[0x04, 0x03, 0x02, 0x01]);
        // field 2, wire type 5
        assert_eq!(bytes[5], 0x15);
    }

    #[test]
    fn test_unknown_from_radio_variant_is_skipped() {
        // FromRadio { id: 3, rebooted (tag 8): true }
        let bytes = [0x08, 0x03, 0x40, 0x01];
        let msg = FromRadio::decode(&bytes[..]).unwrap();
        assert_eq!(msg.id, 3);
        assert!(msg.payload_variant.is_none());
    }

    #[test]
    fn test_node_info_decode() {
        let info = NodeInfo {
            num: 42,
            user: Some(User {
                id: "!0000002a".into(),
                long_name: "Base Station".into(),
                short_name: "BS".into(),
            }),
            hops_away: Some(2),
            ..Default::default()
        };
        let msg = FromRadio {
            id: 1,
            payload_variant: Some(from_radio::PayloadVariant::NodeInfo(info.clone())),
        };
        let decoded = FromRadio::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(
            decoded.payload_variant,
            Some(from_radio::PayloadVariant::NodeInfo(info))
        );
    }
}
