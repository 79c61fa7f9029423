//! Tokenizing of enforcer event lines.
//!
//! Every shape is delimiter-separated with a fixed arity; a line with too
//! few or too many fields is malformed and dropped with an error log, as is
//! any event whose user key is not printable ASCII.

use tracing::error;

use crate::events::DELIMITER;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqEvent {
    pub user_key: String,
    pub verb: String,
    pub direction: String,
    pub instance_id: String,
    pub active_requests: i64,
    pub request_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqEndEvent {
    pub user_key: String,
    pub direction: String,
    pub instance_id: String,
    pub active_requests: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataXferEvent {
    pub user_key: String,
    pub direction: String,
    pub bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveReqsEvent {
    pub instance_id: String,
    pub user_key: String,
    pub direction: String,
    pub active_requests: i64,
}

// Split into exactly N fields; anything else is a malformed line.
fn fields<const N: usize>(line: &str) -> Option<[&str; N]> {
    let mut split = line.split(DELIMITER);
    let mut out = [""; N];
    for slot in &mut out {
        *slot = split.next()?;
    }
    if split.next().is_some() {
        return None;
    }
    Some(out)
}

fn is_printable_ascii(key: &str) -> bool {
    key.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// `req ~|~ source ~|~ user_key ~|~ verb ~|~ direction ~|~ instance ~|~ active ~|~ class?`
///
/// The trailing class may be empty but its field must be present.
pub fn parse_req(line: &str) -> Option<ReqEvent> {
    let Some([_, _source, user_key, verb, direction, instance_id, active, request_class]) =
        fields::<8>(line)
    else {
        error!("unexpected request format: {line}");
        return None;
    };
    let Ok(active_requests) = active.parse::<i64>() else {
        error!("unexpected active request format: {line}");
        return None;
    };
    if !is_printable_ascii(user_key) {
        error!("invalid access key: {user_key}");
        return None;
    }
    Some(ReqEvent {
        user_key: user_key.to_string(),
        verb: verb.to_string(),
        direction: direction.to_string(),
        instance_id: instance_id.to_string(),
        active_requests,
        request_class: request_class.to_string(),
    })
}

/// `req_end ~|~ source ~|~ user_key ~|~ verb ~|~ direction ~|~ instance ~|~ active`
pub fn parse_req_end(line: &str) -> Option<ReqEndEvent> {
    let Some([_, _source, user_key, _verb, direction, instance_id, active]) = fields::<7>(line)
    else {
        error!("unexpected request-end format: {line}");
        return None;
    };
    let Ok(active_requests) = active.parse::<i64>() else {
        error!("unexpected request-end format: {line}");
        return None;
    };
    if !is_printable_ascii(user_key) {
        error!("invalid access key: {user_key}");
        return None;
    }
    Some(ReqEndEvent {
        user_key: user_key.to_string(),
        direction: direction.to_string(),
        instance_id: instance_id.to_string(),
        active_requests,
    })
}

/// `data_xfer ~|~ source ~|~ user_key ~|~ direction ~|~ bytes`
pub fn parse_data_xfer(line: &str) -> Option<DataXferEvent> {
    let Some([_, _source, user_key, direction, len]) = fields::<5>(line) else {
        error!("unexpected data_xfer format: {line}");
        return None;
    };
    let Ok(bytes) = len.parse::<i64>() else {
        error!("unexpected data_xfer format: {line}");
        return None;
    };
    if !is_printable_ascii(user_key) {
        error!("invalid access key: {user_key}");
        return None;
    }
    Some(DataXferEvent {
        user_key: user_key.to_string(),
        direction: direction.to_string(),
        bytes,
    })
}

/// `active_reqs ~|~ instance ~|~ user_key ~|~ direction ~|~ count`
pub fn parse_active_reqs(line: &str) -> Option<ActiveReqsEvent> {
    let Some([_, instance_id, user_key, direction, count]) = fields::<5>(line) else {
        error!("unexpected active-requests format: {line}");
        return None;
    };
    let Ok(active_requests) = count.parse::<i64>() else {
        error!("unexpected active-requests format: {line}");
        return None;
    };
    if !is_printable_ascii(user_key) {
        error!("invalid access key: {user_key}");
        return None;
    }
    Some(ActiveReqsEvent {
        instance_id: instance_id.to_string(),
        user_key: user_key.to_string(),
        direction: direction.to_string(),
        active_requests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_with_class() {
        let ev = parse_req("req~|~1.2.3.4:58840~|~AKIA~|~PUT~|~up~|~inst-1~|~7~|~LISTBUCKETS")
            .expect("valid req");
        assert_eq!(ev.user_key, "AKIA");
        assert_eq!(ev.verb, "PUT");
        assert_eq!(ev.active_requests, 7);
        assert_eq!(ev.request_class, "LISTBUCKETS");
    }

    #[test]
    fn req_with_empty_class() {
        let ev = parse_req("req~|~1.2.3.4:80~|~u~|~GET~|~dwn~|~i~|~1~|~").expect("valid req");
        assert!(ev.request_class.is_empty());
    }

    #[test]
    fn req_missing_field_is_rejected() {
        assert!(parse_req("req~|~1.2.3.4:80~|~u~|~GET~|~dwn~|~i~|~1").is_none());
    }

    #[test]
    fn req_extra_field_is_rejected() {
        assert!(parse_req("req~|~1.2.3.4:80~|~u~|~GET~|~dwn~|~i~|~1~|~c~|~extra").is_none());
    }

    #[test]
    fn non_printable_user_key_is_rejected() {
        assert!(parse_req("req~|~1.2.3.4:80~|~u\u{7}ser~|~GET~|~dwn~|~i~|~1~|~").is_none());
        assert!(parse_data_xfer("data_xfer~|~1.2.3.4:80~|~\u{1b}key~|~up~|~10").is_none());
    }

    #[test]
    fn bad_integer_is_rejected() {
        assert!(parse_data_xfer("data_xfer~|~1.2.3.4:80~|~u~|~up~|~ten").is_none());
        assert!(parse_active_reqs("active_reqs~|~i~|~u~|~up~|~NaN").is_none());
    }

    #[test]
    fn data_xfer_and_active_reqs_shapes() {
        let xfer = parse_data_xfer("data_xfer~|~1.2.3.4:55094~|~AKIA~|~dwn~|~4096")
            .expect("valid data_xfer");
        assert_eq!(xfer.bytes, 4096);
        assert_eq!(xfer.direction, "dwn");

        let active = parse_active_reqs("active_reqs~|~inst-1~|~AKIA~|~up~|~7")
            .expect("valid active_reqs");
        assert_eq!(active.instance_id, "inst-1");
        assert_eq!(active.active_requests, 7);
    }

    #[test]
    fn req_end_skips_verb() {
        let ev = parse_req_end("req_end~|~1.2.3.4:58840~|~AKIA~|~PUT~|~up~|~inst-1~|~6")
            .expect("valid req_end");
        assert_eq!(ev.user_key, "AKIA");
        assert_eq!(ev.active_requests, 6);
    }
}
