use serde::{Deserialize, Serialize};

use weft_model::{NodeId, OverlayId};

use crate::cbt::{Cbt, CbtTag};
use crate::names;
use crate::nexus::ModuleHandle;

/// An RPC invocation or completion ferried between nodes by the signalling
/// plane.
///
/// The initiator fields and the correlation tag are stamped by the
/// signalling module on the way out; `data` and `status` are filled by the
/// recipient node on the way back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAction {
    pub overlay_id: OverlayId,
    #[serde(default)]
    pub initiator_id: Option<NodeId>,
    #[serde(default)]
    pub initiator_cm: Option<String>,
    pub recipient_id: NodeId,
    pub recipient_cm: String,
    pub action: String,
    #[serde(default)]
    pub action_tag: Option<CbtTag>,
    pub params: serde_json::Value,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<bool>,
}

impl RemoteAction {
    pub fn new(
        overlay_id: OverlayId,
        recipient_id: NodeId,
        recipient_cm: &str,
        action: &str,
        params: impl Serialize,
    ) -> Self {
        let params = serde_json::to_value(params)
            .unwrap_or_else(|e| serde_json::Value::String(format!("unserializable params: {e}")));

        Self {
            overlay_id,
            initiator_id: None,
            initiator_cm: None,
            recipient_id,
            recipient_cm: recipient_cm.to_owned(),
            action: action.to_owned(),
            action_tag: None,
            params,
            data: None,
            status: None,
        }
    }

    /// Hands this action to the signalling module on behalf of `parent`.
    pub fn submit(self, handle: &ModuleHandle, parent: Cbt) -> CbtTag {
        handle.submit_chained(names::SIGNALLING, names::REMOTE_ACTION, self, parent)
    }

    /// Deserializes the reply payload into a typed view.
    pub fn reply_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(serde_json::Value::Null))
    }

    /// Deserializes the request parameters into a typed view.
    pub fn request_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_round_trip_preserves_everything() {
        let mut act = RemoteAction::new(
            OverlayId::from("ol001"),
            NodeId::from("peer-b"),
            names::LINK_TUNNEL,
            names::REQUEST_LINK_ENDPOINT,
            serde_json::json!({"TunnelId": "tnl-1"}),
        );
        act.initiator_id = Some(NodeId::from("peer-a"));
        act.initiator_cm = Some(names::LINK_TUNNEL.to_owned());
        act.action_tag = Some(CbtTag::for_test(7));
        act.status = Some(true);

        let json = serde_json::to_string(&act).unwrap();
        let parsed = serde_json::from_str::<RemoteAction>(&json).unwrap();

        assert_eq!(parsed, act);
    }

    #[test]
    fn minimal_wire_form_deserializes() {
        let json = r#"{
            "overlay_id": "ol001",
            "recipient_id": "peer-b",
            "recipient_cm": "link-tunnel",
            "action": "request_link_endpoint",
            "params": {}
        }"#;

        let act = serde_json::from_str::<RemoteAction>(json).unwrap();

        assert_eq!(act.initiator_id, None);
        assert_eq!(act.action_tag, None);
        assert_eq!(act.status, None);
    }
}
