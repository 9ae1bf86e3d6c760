//! Command protocol tests over the wire
//!
//! Raw requests against producer endpoints, checking the byte layouts a
//! producer built elsewhere would see.

use std::sync::Arc;

use admbridge::network::{
    CommandRequester, NetworkError, ProducerEndpoint, StaticProducer, TransportConfig,
};
use admbridge::protocol::{
    ChannelTable, Command, CommandReply, CommandRequest, MetadataExchange, ProtocolError,
    CHANNEL_TABLE_SIZE, CONFIG_REPORT_SIZE, ERROR_REPLY,
};

fn transport_config() -> TransportConfig {
    TransportConfig {
        port_range_start: 48000,
        port_range_end: 48999,
        ..Default::default()
    }
}

fn connect(producer: StaticProducer) -> (ProducerEndpoint, CommandRequester) {
    let config = transport_config();
    let endpoint = ProducerEndpoint::listen(Arc::new(producer), &config).unwrap();
    let requester = CommandRequester::dial(endpoint.command_port(), &config).unwrap();
    (endpoint, requester)
}

/// Test: GetConfig reply layout
/// Given an export source with 2 channels at 48 kHz
/// When the raw GetConfig opcode is sent
/// Then the reply is the 11-byte little-endian config report
#[test]
fn test_get_config_bytes() {
    let (_endpoint, requester) =
        connect(StaticProducer::export_source(2, 48000).with_formats(0x0001, 0x0002, 0x0003));

    let reply = requester.request(&[Command::GetConfig as u8]).unwrap();
    let bytes = reply.as_slice();

    assert_eq!(bytes.len(), CONFIG_REPORT_SIZE);
    assert_eq!(bytes[0], 2);
    assert_eq!(&bytes[1..5], &48000u32.to_le_bytes());
    assert_eq!(&bytes[5..7], &0x0001u16.to_le_bytes());
    assert_eq!(&bytes[7..9], &0x0002u16.to_le_bytes());
    assert_eq!(&bytes[9..11], &0x0003u16.to_le_bytes());
}

/// Test: Export sources answer render commands with their config
#[test]
fn test_export_source_render_reply() {
    let producer = StaticProducer::export_source(1, 44100);
    let expected = producer.config();
    let (_endpoint, requester) = connect(producer);

    let reply = requester.do_command(&CommandRequest::StartRender).unwrap();
    assert_eq!(reply, CommandReply::Config(expected));
}

/// Test: Scene metadata exchange
/// Given a scene producer
/// When a table and document are set and read back
/// Then the reply is the 256-byte table followed by the document
#[test]
fn test_scene_metadata_exchange() {
    let (_endpoint, requester) = connect(StaticProducer::scene(48000, ChannelTable::new(), ""));

    let mut table = ChannelTable::new();
    table.set(0, 0x0001_1001);
    table.set(9, 0x0001_100A);
    let document = "<audioFormatExtended>ü</audioFormatExtended>";
    let request = CommandRequest::SetAdmAndMappings(MetadataExchange::new(table.clone(), document));

    let ack = requester.do_command(&request).unwrap();
    assert_eq!(ack, CommandReply::ack(Command::SetAdmAndMappings));

    let raw = requester
        .request(&[Command::GetAdmAndMappings as u8])
        .unwrap();
    assert_eq!(raw.len(), CHANNEL_TABLE_SIZE + document.len());
    assert_eq!(&raw.as_slice()[36..40], &0x0001_100Au32.to_le_bytes());
    assert_eq!(&raw.as_slice()[CHANNEL_TABLE_SIZE..], document.as_bytes());

    let exchange = requester
        .do_command(&CommandRequest::GetAdmAndMappings)
        .unwrap()
        .into_metadata(Command::GetAdmAndMappings)
        .unwrap();
    assert_eq!(exchange.table, table);
    assert_eq!(exchange.document, document);
}

/// Test: Every request is answered
/// When the producer cannot handle a request
/// Then it still replies, with the error byte
#[test]
fn test_unanswerable_requests_get_error_byte() {
    let (_endpoint, requester) = connect(StaticProducer::export_source(2, 48000));

    let unknown = requester.request(&[0x42]).unwrap();
    assert_eq!(unknown.as_slice(), &[ERROR_REPLY]);

    let empty = requester.request(&[]).unwrap();
    assert_eq!(empty.as_slice(), &[ERROR_REPLY]);

    let truncated = requester
        .request(&[Command::SetAdmAndMappings as u8, 0, 0])
        .unwrap();
    assert_eq!(truncated.as_slice(), &[ERROR_REPLY]);

    let unsupported = requester.do_command(&CommandRequest::GetAdmAndMappings);
    assert!(matches!(
        unsupported,
        Err(NetworkError::Protocol(ProtocolError::ProducerRejected(
            Command::GetAdmAndMappings
        )))
    ));
}

/// Test: Responder serves several requesters
#[test]
fn test_multiple_requesters() {
    let config = transport_config();
    let endpoint =
        ProducerEndpoint::listen(Arc::new(StaticProducer::export_source(4, 96000)), &config)
            .unwrap();

    let requesters: Vec<CommandRequester> = (0..3)
        .map(|_| CommandRequester::dial(endpoint.command_port(), &config).unwrap())
        .collect();

    for requester in &requesters {
        let report = requester
            .do_command(&CommandRequest::GetConfig)
            .unwrap()
            .into_config(Command::GetConfig)
            .unwrap();
        assert_eq!(report.channels, 4);
        assert_eq!(report.sample_rate, 96000);
    }
}
