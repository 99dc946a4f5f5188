use std::{net::SocketAddr, sync::Arc};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rand::Rng;

use codec::{
    Error, MEDIATYPE_APPLICATION_OCTET_STREAM, MessageKind, REQUEST_GET, Token, encode_var_bytes,
    key::ResourceKey,
    option::OptionType,
    payload::{PacketKind, SensorKind},
    pdu::Pdu,
    response_code,
};
use service::{Endpoint, Transport, observe::Registration, resource::Resource};

/// The observable sensor resources this server exposes.
pub const SENSORS: [(&str, SensorKind); 4] = [
    ("sensors/accel", SensorKind::Accelerometer),
    ("sensors/gyro", SensorKind::Gyroscope),
    ("sensors/light", SensorKind::Light),
    ("sensors/proximity", SensorKind::Proximity),
];

/// Stand-in for the streaming layer: it holds the checked-out
/// registration handles returned by the request handlers and gives them
/// back when a stream is torn down.
#[derive(Default, Clone)]
pub struct Streams(Arc<Mutex<Vec<Arc<Registration>>>>);

impl Streams {
    /// Starts holding a handle. Returns false when the registration is
    /// already held, in which case the extra checkout is the caller's
    /// to release.
    pub fn hold(&self, reg: Arc<Registration>) -> bool {
        let mut held = self.0.lock();
        if held.iter().any(|other| Arc::ptr_eq(other, &reg)) {
            return false;
        }

        held.push(reg);
        true
    }

    /// Gives a held handle back for release.
    pub fn forget(&self, reg: &Arc<Registration>) -> Option<Arc<Registration>> {
        let mut held = self.0.lock();
        let index = held.iter().position(|other| Arc::ptr_eq(other, reg))?;
        Some(held.swap_remove(index))
    }

    pub fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.0.lock().clone()
    }
}

/// Sensor kind behind a resource key, for building notifications.
pub fn kind_for(key: ResourceKey) -> Option<SensorKind> {
    SENSORS
        .iter()
        .find(|(path, _)| ResourceKey::from_path(path) == key)
        .map(|(_, sensor)| *sensor)
}

pub fn register_all<T: Transport>(endpoint: &mut Endpoint<T>, streams: &Streams) {
    for (path, sensor) in SENSORS {
        endpoint.resources_mut().insert(resource(path, sensor, streams));
    }
}

fn resource(path: &str, sensor: SensorKind, streams: &Streams) -> Resource {
    let mut resource = Resource::new(path);

    let held = streams.clone();
    resource.set_handler(REQUEST_GET, move |resource, peer, request, token, response| {
        if let Err(error) = respond(sensor, &held, resource, peer, request, token, response) {
            log::warn!("cannot fill response for {}: {error}", resource.path());
        }
    });

    let held = streams.clone();
    resource.set_unregister(move |resource, reg| {
        log::info!("stream teardown for {} on {}", reg.peer(), resource.path());
        if let Some(handle) = held.forget(reg) {
            resource.release_registration(handle);
        }
    });

    resource
}

/// GET handler: serves the latest datapoint and, when the request
/// carries the Observe option, registers the peer as a subscriber.
fn respond(
    sensor: SensorKind,
    streams: &Streams,
    resource: &mut Resource,
    peer: &SocketAddr,
    request: &Pdu,
    token: &Token,
    response: &mut Pdu,
) -> Result<(), Error> {
    response.set_code(response_code(205));

    let mut buf = [0u8; 4];
    let length = encode_var_bytes(MEDIATYPE_APPLICATION_OCTET_STREAM, &mut buf);
    response.add_option(OptionType::ContentType as u16, &buf[..length])?;

    if request
        .option_first(OptionType::Observe as u16)
        .is_some()
    {
        let reg = resource.add_registration(*peer, token);
        let sequence = reg.next_notification();

        let length = encode_var_bytes(sequence as u32, &mut buf);
        response.add_option(OptionType::Observe as u16, &buf[..length])?;

        // A re-register refreshes the existing stream; the extra
        // checkout goes straight back.
        if !streams.hold(reg.clone()) {
            resource.release_registration(reg);
        }
    }

    if !token.is_empty() {
        response.add_option(OptionType::Token as u16, token.as_slice())?;
    }

    response.add_data(&datapoint(sensor));
    Ok(())
}

/// One fresh datapoint payload: the two-byte header and three samples.
pub fn datapoint(sensor: SensorKind) -> BytesMut {
    let mut data = BytesMut::with_capacity(8);
    data.put_u8(PacketKind::Datapoint.into());
    data.put_u8(sensor.into());
    for _ in 0..3 {
        data.put_i16(rand::rng().random());
    }

    data
}

/// Builds one notification PDU for a subscriber. Returns the PDU and
/// its payload size for the stream counters.
pub fn notification(
    reg: &Arc<Registration>,
    sensor: SensorKind,
    confirmable: bool,
    mid: u16,
) -> Result<(Pdu, usize), Error> {
    let kind = if confirmable {
        MessageKind::Confirmable
    } else {
        MessageKind::NonConfirmable
    };

    let mut pdu = Pdu::new(kind, response_code(205), mid);

    let mut buf = [0u8; 4];
    let length = encode_var_bytes(MEDIATYPE_APPLICATION_OCTET_STREAM, &mut buf);
    pdu.add_option(OptionType::ContentType as u16, &buf[..length])?;

    let length = encode_var_bytes(reg.next_notification() as u32, &mut buf);
    pdu.add_option(OptionType::Observe as u16, &buf[..length])?;

    let token = reg.token();
    if !token.is_empty() {
        pdu.add_option(OptionType::Token as u16, token.as_slice())?;
    }

    let data = datapoint(sensor);
    pdu.add_data(&data);
    Ok((pdu, data.len()))
}
