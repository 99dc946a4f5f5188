use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use parking_lot::Mutex;

use coap_server_service::{
    Endpoint, EndpointOptions, MAX_RETRANSMIT, Transport,
    dedup::EXCHANGE_LIFETIME,
    observe::Registration,
    queue::{SendQueue, Tick, TransmitEntry},
    resource::Resource,
    statistics::Number,
};
use codec::{
    MessageKind, REQUEST_GET, Token,
    option::OptionType,
    payload::{PacketKind, SensorKind},
    pdu::Pdu,
    response_code,
};

/// Transport stub that records every outgoing datagram.
#[derive(Default, Clone)]
struct Capture(Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>);

impl Transport for Capture {
    fn send(&self, to: &SocketAddr, bytes: &[u8]) -> std::io::Result<usize> {
        self.0.lock().push((*to, bytes.to_vec()));
        Ok(bytes.len())
    }
}

impl Capture {
    fn take(&self) -> Vec<Pdu> {
        std::mem::take(&mut *self.0.lock())
            .into_iter()
            .map(|(_, bytes)| Pdu::decode(&bytes).expect("sent malformed bytes"))
            .collect()
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

fn endpoint() -> (Endpoint<Capture>, Capture) {
    let capture = Capture::default();
    let endpoint = Endpoint::new(EndpointOptions {
        local: "127.0.0.1:5683".parse().unwrap(),
        transport: capture.clone(),
    });

    (endpoint, capture)
}

fn peer() -> SocketAddr {
    "10.0.0.1:5683".parse().unwrap()
}

fn con_get(segments: &[&str], mid: u16, token: &[u8], observe: bool) -> Pdu {
    let mut request = Pdu::new(MessageKind::Confirmable, REQUEST_GET, mid);
    for segment in segments {
        request
            .add_option(OptionType::UriPath as u16, segment.as_bytes())
            .unwrap();
    }

    if observe {
        request
            .add_option(OptionType::Observe as u16, &[])
            .unwrap();
    }

    if !token.is_empty() {
        request
            .add_option(OptionType::Token as u16, token)
            .unwrap();
    }

    request
}

fn notification(mid: u16, token: &[u8]) -> Pdu {
    let mut pdu = Pdu::new(MessageKind::Confirmable, response_code(205), mid);
    if !token.is_empty() {
        pdu.add_option(OptionType::Token as u16, token).unwrap();
    }

    pdu.add_data(&[
        PacketKind::Datapoint as u8,
        SensorKind::Accelerometer as u8,
        0,
        1,
        0,
        2,
    ]);

    pdu
}

type Held = Arc<Mutex<Vec<Arc<Registration>>>>;

/// An observable resource whose GET handler registers subscribers and
/// hands the checked-out handles to `held`, the test's streaming layer.
/// `teardowns` counts unregister-hook invocations.
fn observed_resource(path: &str, held: &Held, teardowns: &Arc<Mutex<u32>>) -> Resource {
    let mut resource = Resource::new(path);

    {
        let held = held.clone();
        resource.set_handler(
            REQUEST_GET,
            move |resource, peer, _request, token, response| {
                response.set_code(response_code(205));
                let reg = resource.add_registration(*peer, token);
                held.lock().push(reg);
            },
        );
    }

    {
        let held = held.clone();
        let teardowns = teardowns.clone();
        resource.set_unregister(move |resource, reg| {
            *teardowns.lock() += 1;
            let mut held = held.lock();
            if let Some(index) = held.iter().position(|other| Arc::ptr_eq(other, reg)) {
                let handle = held.swap_remove(index);
                resource.release_registration(handle);
            }
        });
    }

    resource
}

#[test]
fn test_wellknown_core_get() -> Result<()> {
    let (mut endpoint, capture) = endpoint();
    endpoint.resources_mut().insert(Resource::new("sensors/accel"));

    let request = con_get(&[".well-known", "core"], 0x1234, b"", false);
    endpoint.receive(request.wire(), peer(), 0)?;
    endpoint.dispatch(0);

    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind(), MessageKind::Acknowledgement);
    assert_eq!(sent[0].code(), response_code(205));
    assert_eq!(sent[0].message_id(), 0x1234);
    assert_eq!(
        sent[0].option_first(OptionType::ContentType as u16),
        Some(&[40u8][..])
    );
    assert!(std::str::from_utf8(sent[0].data())?.contains("</sensors/accel>"));
    Ok(())
}

#[test]
fn test_unknown_critical_option() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let mut request = Pdu::new(MessageKind::Confirmable, REQUEST_GET, 0x0042);
    request.add_option(OptionType::Token as u16, b"tk")?;
    request.add_option(99, b"xyz")?;

    endpoint.receive(request.wire(), peer(), 0)?;
    endpoint.dispatch(0);

    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind(), MessageKind::Acknowledgement);
    assert_eq!(sent[0].code(), response_code(402));
    assert_eq!(sent[0].message_id(), 0x0042);
    assert_eq!(sent[0].token().as_slice(), b"tk");
    assert_eq!(sent[0].option_first(99), Some(&b"xyz"[..]));
    Ok(())
}

#[test]
fn test_unknown_critical_option_on_non_drops_silently() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let mut request = Pdu::new(MessageKind::NonConfirmable, REQUEST_GET, 0x0043);
    request.add_option(99, b"xyz")?;

    endpoint.receive(request.wire(), peer(), 0)?;
    endpoint.dispatch(0);

    assert_eq!(capture.len(), 0);
    Ok(())
}

#[test]
fn test_duplicate_con_replay() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let calls = Arc::new(Mutex::new(0u32));
    let mut resource = Resource::new("sensors/light");
    {
        let calls = calls.clone();
        resource.set_handler(
            REQUEST_GET,
            move |_resource, _peer, _request, _token, response| {
                *calls.lock() += 1;
                response.set_code(response_code(205));
            },
        );
    }
    endpoint.resources_mut().insert(resource);

    let request = con_get(&["sensors", "light"], 0x0077, b"", false);
    endpoint.receive(request.wire(), peer(), 0)?;
    endpoint.dispatch(0);

    // Same peer, same message id, one second later.
    endpoint.receive(request.wire(), peer(), 1024)?;
    endpoint.dispatch(1024);

    assert_eq!(*calls.lock(), 1);
    assert_eq!(endpoint.statistics().duplicates.get(), 1);

    let sent = capture.take();
    assert_eq!(sent.len(), 2);
    for response in &sent {
        assert_eq!(response.kind(), MessageKind::Acknowledgement);
        assert_eq!(response.message_id_bytes(), [0x00, 0x77]);
    }

    Ok(())
}

#[test]
fn test_duplicate_non_dropped() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let calls = Arc::new(Mutex::new(0u32));
    let mut resource = Resource::new("sensors/light");
    {
        let calls = calls.clone();
        resource.set_handler(
            REQUEST_GET,
            move |_resource, _peer, _request, _token, response| {
                *calls.lock() += 1;
                response.set_code(response_code(205));
            },
        );
    }
    endpoint.resources_mut().insert(resource);

    let mut request = Pdu::new(MessageKind::NonConfirmable, REQUEST_GET, 0x0099);
    request.add_option(OptionType::UriPath as u16, b"sensors")?;
    request.add_option(OptionType::UriPath as u16, b"light")?;

    endpoint.receive(request.wire(), peer(), 0)?;
    endpoint.dispatch(0);
    endpoint.receive(request.wire(), peer(), 512)?;
    endpoint.dispatch(512);

    assert_eq!(*calls.lock(), 1);
    assert_eq!(capture.len(), 1);
    assert_eq!(endpoint.statistics().duplicates.get(), 1);

    // Past the exchange lifetime the id is forgotten and the handler
    // runs again.
    endpoint.receive(request.wire(), peer(), EXCHANGE_LIFETIME + 1024)?;
    endpoint.dispatch(EXCHANGE_LIFETIME + 1024);
    assert_eq!(*calls.lock(), 2);

    Ok(())
}

#[test]
fn test_observer_registration_and_ack() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let held: Held = Held::default();
    let teardowns = Arc::new(Mutex::new(0u32));
    endpoint
        .resources_mut()
        .insert(observed_resource("sensors/accel", &held, &teardowns));

    endpoint.receive(
        con_get(&["sensors", "accel"], 0x0001, b"tk", true).wire(),
        peer(),
        0,
    )?;
    endpoint.dispatch(0);
    capture.take();

    let reg = held.lock()[0].clone();
    assert_eq!(reg.refcnt(), 1);

    endpoint.notify_confirmed(peer(), notification(0x0100, b"tk"), reg.checkout(), 0);
    assert_eq!(reg.refcnt(), 2);
    assert_eq!(capture.len(), 1);

    // The ACK arrives before the first timeout.
    let ack = Pdu::new(MessageKind::Acknowledgement, 0, 0x0100);
    endpoint.receive(ack.wire(), peer(), 100)?;
    endpoint.dispatch(100);

    assert_eq!(reg.fail_cnt(), 0);
    assert!(!reg.is_invalid());
    assert!(endpoint.can_exit());
    assert_eq!(reg.refcnt(), 1);
    assert_eq!(*teardowns.lock(), 0);

    let key = reg.reskey();
    assert_eq!(endpoint.resources().get(&key).unwrap().subscribers().len(), 1);
    Ok(())
}

#[test]
fn test_observer_registration_and_rst() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let held: Held = Held::default();
    let teardowns = Arc::new(Mutex::new(0u32));
    endpoint
        .resources_mut()
        .insert(observed_resource("sensors/accel", &held, &teardowns));

    endpoint.receive(
        con_get(&["sensors", "accel"], 0x0001, b"tk", true).wire(),
        peer(),
        0,
    )?;
    endpoint.dispatch(0);
    capture.take();

    let reg = held.lock()[0].clone();
    let key = reg.reskey();

    // Two notifications in flight, then the peer resets the first.
    endpoint.notify_confirmed(peer(), notification(0x0200, b"tk"), reg.checkout(), 0);
    endpoint.notify_confirmed(peer(), notification(0x0201, b"tk"), reg.checkout(), 0);
    assert_eq!(reg.refcnt(), 3);

    let rst = Pdu::new(MessageKind::Reset, 0, 0x0200);
    endpoint.receive(rst.wire(), peer(), 100)?;
    endpoint.dispatch(100);

    assert_eq!(*teardowns.lock(), 1);
    assert!(reg.is_invalid());
    assert!(held.lock().is_empty());
    // The second in-flight notification still pins the record.
    assert_eq!(reg.refcnt(), 1);
    assert_eq!(endpoint.resources().get(&key).unwrap().subscribers().len(), 1);

    // A later RST for the second notification must not re-invoke the
    // hook, only give the queue's reference back.
    let rst = Pdu::new(MessageKind::Reset, 0, 0x0201);
    endpoint.receive(rst.wire(), peer(), 200)?;
    endpoint.dispatch(200);

    assert_eq!(*teardowns.lock(), 1);
    assert_eq!(reg.refcnt(), 0);
    assert!(endpoint.resources().get(&key).unwrap().subscribers().is_empty());
    assert!(endpoint.can_exit());
    Ok(())
}

#[test]
fn test_retransmit_exhaustion() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let held: Held = Held::default();
    let teardowns = Arc::new(Mutex::new(0u32));
    endpoint
        .resources_mut()
        .insert(observed_resource("sensors/accel", &held, &teardowns));

    endpoint.receive(
        con_get(&["sensors", "accel"], 0x0001, b"tk", true).wire(),
        peer(),
        0,
    )?;
    endpoint.dispatch(0);
    capture.take();

    let reg = held.lock()[0].clone();
    endpoint.notify_confirmed(peer(), notification(0x0300, b"tk"), reg.checkout(), 0);
    assert_eq!(capture.len(), 1);
    capture.take();

    // No reply ever arrives: a late driver fires every doubling in one
    // sweep, then gives up.
    endpoint.retransmit(Tick::MAX);

    let replays = capture.take();
    assert_eq!(replays.len(), MAX_RETRANSMIT as usize);
    for replay in &replays {
        assert_eq!(replay.message_id(), 0x0300);
        // The payload tag was flipped on the first retransmission.
        assert_eq!(replay.data()[0], PacketKind::DatapointRetransmitted as u8);
    }

    assert_eq!(*teardowns.lock(), 1);
    assert!(reg.is_invalid());
    assert!(endpoint.can_exit());

    let statistics = endpoint.statistics();
    assert_eq!(statistics.retransmits.get(), MAX_RETRANSMIT as u64);
    assert_eq!(
        statistics.sensor_retransmits[SensorKind::Accelerometer.index()].get(),
        MAX_RETRANSMIT as u64
    );

    // Nothing more fires for this transaction.
    endpoint.retransmit(Tick::MAX);
    assert_eq!(capture.len(), 0);
    Ok(())
}

#[test]
fn test_send_queue_ordering() {
    let entry = |id, t| TransmitEntry {
        pdu: Pdu::new(MessageKind::Confirmable, 0, id as u16),
        peer: peer(),
        id,
        t,
        timeout: 150,
        retransmit_cnt: 0,
        registration: None,
    };

    let mut queue = SendQueue::default();
    queue.insert(entry(1, 5));
    queue.insert(entry(2, 1));
    queue.insert(entry(3, 5));
    queue.insert(entry(4, 3));

    let order: Vec<(Tick, u32)> = {
        let mut popped = Vec::new();
        while let Some(entry) = queue.pop_due(Tick::MAX) {
            popped.push((entry.t, entry.id));
        }
        popped
    };

    // Non-decreasing firing times, insertion order among ties.
    assert_eq!(order, vec![(1, 2), (3, 4), (5, 1), (5, 3)]);
}

#[test]
fn test_registration_refcount_discipline() {
    let mut resource = Resource::new("sensors/accel");

    let reg = resource.add_registration(peer(), &Token::new(b"t1"));
    assert_eq!(reg.refcnt(), 1);
    assert_eq!(resource.subscribers().len(), 1);

    // Re-registering keeps the pointer identity and overwrites the
    // token with the incoming one.
    let again = resource.add_registration(peer(), &Token::new(b"t2"));
    assert!(Arc::ptr_eq(&reg, &again));
    assert_eq!(reg.token().as_slice(), b"t2");
    assert_eq!(reg.refcnt(), 2);
    assert_eq!(resource.subscribers().len(), 1);

    let extra = reg.checkout();
    assert_eq!(reg.refcnt(), 3);

    resource.release_registration(extra);
    resource.release_registration(again);
    assert_eq!(reg.refcnt(), 1);
    assert_eq!(resource.subscribers().len(), 1);

    // The balancing release is the unique point the record goes away.
    resource.release_registration(reg.clone());
    assert_eq!(reg.refcnt(), 0);
    assert!(resource.subscribers().is_empty());
}

#[test]
fn test_malformed_con_elicits_rst() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    // Valid header claiming one option, with a value overrunning the
    // datagram.
    let bytes = [0x41, 0x01, 0x00, 0x55, 0x95, b'a'];
    assert!(endpoint.receive(&bytes, peer(), 0).is_err());

    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind(), MessageKind::Reset);
    assert_eq!(sent[0].message_id(), 0x0055);

    // An unparseable ACK is dropped without a reply.
    let bytes = [0x61, 0x01, 0x00, 0x56, 0x95, b'a'];
    assert!(endpoint.receive(&bytes, peer(), 0).is_err());
    assert_eq!(capture.len(), 0);
    Ok(())
}

#[test]
fn test_invalid_code_elicits_rst() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    // Code 50 is neither request nor response.
    let message = Pdu::new(MessageKind::Confirmable, 50, 0x0060);
    endpoint.receive(message.wire(), peer(), 0)?;
    endpoint.dispatch(0);

    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind(), MessageKind::Reset);
    assert_eq!(sent[0].message_id(), 0x0060);
    Ok(())
}

#[test]
fn test_unknown_resource_responses() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    endpoint.receive(con_get(&["nowhere"], 0x0010, b"", false).wire(), peer(), 0)?;
    endpoint.dispatch(0);

    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].code(), response_code(404));

    let mut request = Pdu::new(MessageKind::Confirmable, codec::REQUEST_PUT, 0x0011);
    request.add_option(OptionType::UriPath as u16, b"nowhere")?;
    endpoint.receive(request.wire(), peer(), 0)?;
    endpoint.dispatch(0);

    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].code(), response_code(405));
    Ok(())
}

#[test]
fn test_response_routing() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let seen: Arc<Mutex<Vec<(bool, u8)>>> = Arc::default();
    {
        let seen = seen.clone();
        endpoint.set_response_handler(move |_peer, request, response, _id| {
            seen.lock().push((request.is_some(), response.code()));
        });
    }

    // An outstanding confirmable request of our own.
    let request = con_get(&["sensors", "accel"], 0x0500, b"rq", false);
    endpoint.send_confirmed(peer(), request, 0).unwrap();
    capture.take();

    // The piggy-backed response stops the retransmission and reaches
    // the handler together with the matched request.
    let mut response = Pdu::new(MessageKind::Acknowledgement, response_code(205), 0x0500);
    response.add_option(OptionType::Token as u16, b"rq")?;
    endpoint.receive(response.wire(), peer(), 10)?;
    endpoint.dispatch(10);

    assert!(endpoint.can_exit());
    assert_eq!(seen.lock().clone(), vec![(true, response_code(205))]);

    // An unsolicited response still reaches the handler, without a
    // matched request.
    let response = Pdu::new(MessageKind::NonConfirmable, response_code(205), 0x0501);
    endpoint.receive(response.wire(), peer(), 20)?;
    endpoint.dispatch(20);
    assert_eq!(seen.lock().len(), 2);
    assert_eq!(seen.lock()[1].0, false);
    Ok(())
}

#[test]
fn test_confirmable_response_without_handler_gets_ack() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let response = Pdu::new(MessageKind::Confirmable, response_code(205), 0x0700);
    endpoint.receive(response.wire(), peer(), 0)?;
    endpoint.dispatch(0);

    let sent = capture.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind(), MessageKind::Acknowledgement);
    assert_eq!(sent[0].code(), 0);
    assert_eq!(sent[0].message_id(), 0x0700);
    Ok(())
}

#[test]
fn test_shutdown_releases_queued_registrations() -> Result<()> {
    let (mut endpoint, capture) = endpoint();

    let held: Held = Held::default();
    let teardowns = Arc::new(Mutex::new(0u32));
    endpoint
        .resources_mut()
        .insert(observed_resource("sensors/accel", &held, &teardowns));

    endpoint.receive(
        con_get(&["sensors", "accel"], 0x0001, b"tk", true).wire(),
        peer(),
        0,
    )?;
    endpoint.dispatch(0);
    capture.take();

    let reg = held.lock()[0].clone();
    endpoint.notify_confirmed(peer(), notification(0x0400, b"tk"), reg.checkout(), 0);
    assert_eq!(reg.refcnt(), 2);

    endpoint.shutdown();
    assert_eq!(reg.refcnt(), 1);
    assert!(endpoint.can_exit());
    assert!(endpoint.resources().is_empty());
    Ok(())
}
