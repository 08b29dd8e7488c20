// Topic and username grammar for the provisioning service and the hub.
//
// Every string the device puts on the wire or matches against lives here,
// so the protocol engines never format topics by hand.

/// API version carried in the provisioning MQTT username.
pub const DPS_API_VERSION: &str = "2019-03-31";

/// API version carried in the hub MQTT username.
pub const HUB_MQTT_API_VERSION: &str = "2018-06-30";

pub const DPS_RESPONSE_PREFIX: &str = "$dps/registrations/res/";
pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
pub const DESIRED_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired";
pub const COMMAND_PREFIX: &str = "$iothub/methods/POST/";

// ── Usernames ────────────────────────────────────────────────────────

pub fn dps_username(scope_id: &str, registration_id: &str) -> String {
    format!("{scope_id}/registrations/{registration_id}/api-version={DPS_API_VERSION}")
}

pub fn hub_username(host: &str, device_id: &str) -> String {
    format!("{host}/{device_id}/?api-version={HUB_MQTT_API_VERSION}")
}

// ── Provisioning ─────────────────────────────────────────────────────

pub fn dps_response_filter() -> &'static str {
    "$dps/registrations/res/#"
}

pub fn dps_register(request_id: &str) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={request_id}")
}

pub fn dps_poll(request_id: &str, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={request_id}&operationId={operation_id}"
    )
}

/// Fields carried in a provisioning response topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpsResponseTopic {
    pub status: u16,
    pub request_id: String,
    pub retry_after: Option<u64>,
}

/// Parse `$dps/registrations/res/<status>/?$rid=<id>[&retry-after=<s>]`.
pub fn parse_dps_response(topic: &str) -> Option<DpsResponseTopic> {
    let rest = topic.strip_prefix(DPS_RESPONSE_PREFIX)?;
    let (status, query) = rest.split_once("/?")?;
    let status = status.parse().ok()?;

    let mut request_id = None;
    let mut retry_after = None;
    for pair in query.split('&') {
        if let Some(rid) = pair.strip_prefix("$rid=") {
            request_id = Some(rid.to_owned());
        } else if let Some(secs) = pair.strip_prefix("retry-after=") {
            retry_after = secs.parse().ok();
        }
    }

    Some(DpsResponseTopic {
        status,
        request_id: request_id?,
        retry_after,
    })
}

// ── Hub: subscriptions ───────────────────────────────────────────────

pub fn device_bound_filter(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

pub fn device_bound_prefix(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/")
}

pub fn twin_response_filter() -> &'static str {
    "$iothub/twin/res/#"
}

pub fn desired_patch_filter() -> &'static str {
    "$iothub/twin/PATCH/properties/desired/#"
}

pub fn command_filter() -> &'static str {
    "$iothub/methods/POST/#"
}

// ── Hub: publish ─────────────────────────────────────────────────────

pub fn twin_get(request_id: &str) -> String {
    format!("$iothub/twin/GET/?$rid={request_id}")
}

pub fn reported_patch(request_id: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
}

pub fn command_response(status: u16, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

/// Telemetry topic with url-encoded message properties appended.
pub fn telemetry<I, K, V>(device_id: &str, properties: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(properties)
        .finish();
    format!("devices/{device_id}/messages/events/{query}")
}

// ── Hub: inbound parsing ─────────────────────────────────────────────

/// Status code of a `$iothub/twin/res/<status>/...` topic.
pub fn parse_twin_status(topic: &str) -> Option<u16> {
    let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
    rest.split('/').next()?.parse().ok()
}

/// Name and request id of a command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    pub name: String,
    pub request_id: String,
}

/// Parse `$iothub/methods/POST/<commandName>/?$rid=<requestId>`.
pub fn parse_command(topic: &str) -> Option<CommandTopic> {
    let rest = topic.strip_prefix(COMMAND_PREFIX)?;
    let (name, query) = rest.split_once("/?")?;
    if name.is_empty() {
        return None;
    }
    let request_id = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("$rid="))?;
    Some(CommandTopic {
        name: name.to_owned(),
        request_id: request_id.to_owned(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dps_response_with_retry_after() {
        let parsed =
            parse_dps_response("$dps/registrations/res/202/?$rid=abc-123&retry-after=3").unwrap();
        assert_eq!(parsed.status, 202);
        assert_eq!(parsed.request_id, "abc-123");
        assert_eq!(parsed.retry_after, Some(3));
    }

    #[test]
    fn dps_response_multi_digit_retry_after() {
        let parsed =
            parse_dps_response("$dps/registrations/res/202/?$rid=r&retry-after=15").unwrap();
        assert_eq!(parsed.retry_after, Some(15));
    }

    #[test]
    fn dps_response_without_retry_after() {
        let parsed = parse_dps_response("$dps/registrations/res/200/?$rid=abc").unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.retry_after, None);
    }

    #[test]
    fn dps_response_rejects_foreign_topics() {
        assert!(parse_dps_response("$iothub/twin/res/200/?$rid=1").is_none());
        assert!(parse_dps_response("$dps/registrations/res/abc/?$rid=1").is_none());
        assert!(parse_dps_response("$dps/registrations/res/200/?foo=1").is_none());
    }

    #[test]
    fn command_topic_parsing() {
        let parsed = parse_command("$iothub/methods/POST/reboot/?$rid=42").unwrap();
        assert_eq!(parsed.name, "reboot");
        assert_eq!(parsed.request_id, "42");
        assert!(parse_command("$iothub/methods/POST//?$rid=42").is_none());
        assert!(parse_command("$iothub/methods/POST/reboot").is_none());
    }

    #[test]
    fn twin_status_parsing() {
        assert_eq!(parse_twin_status("$iothub/twin/res/200/?$rid=1"), Some(200));
        assert_eq!(
            parse_twin_status("$iothub/twin/res/204/?$rid=1&$version=7"),
            Some(204)
        );
        assert_eq!(parse_twin_status("$iothub/twin/PATCH/properties/desired/"), None);
    }

    #[test]
    fn telemetry_topic_encodes_properties() {
        let topic = telemetry("dev1", [("alert", "high temp"), ("unit", "°C")]);
        assert_eq!(
            topic,
            "devices/dev1/messages/events/alert=high+temp&unit=%C2%B0C"
        );
        let bare = telemetry("dev1", std::iter::empty::<(&str, &str)>());
        assert_eq!(bare, "devices/dev1/messages/events/");
    }

    #[test]
    fn usernames() {
        assert_eq!(
            dps_username("0ne00", "dev1"),
            "0ne00/registrations/dev1/api-version=2019-03-31"
        );
        assert_eq!(
            hub_username("hub.net", "dev1"),
            "hub.net/dev1/?api-version=2018-06-30"
        );
    }
}
