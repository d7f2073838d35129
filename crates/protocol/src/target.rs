//! `Target` domain bindings needed by the session layer.
//!
//! Only the commands and events that drive session lifecycle live here; the
//! rest of the domain belongs to the generated bindings.

use serde::{Deserialize, Serialize};

use crate::command::{Command, Empty, EventType};
use crate::types::{SessionId, TargetId};

/// Description of a remote target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
	pub target_id: TargetId,
	/// `"page"`, `"iframe"`, `"service_worker"`, `"browser"`, ...
	#[serde(rename = "type")]
	pub target_type: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub url: String,
	#[serde(default)]
	pub attached: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub opener_id: Option<TargetId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub browser_context_id: Option<String>,
}

/// Attaches to the target and returns a session id for it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTarget {
	pub target_id: TargetId,
	/// Multiplex the session over this connection (`sessionId` on frames)
	/// instead of the legacy `Target.sendMessageToTarget` tunnelling.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub flatten: Option<bool>,
}

impl AttachToTarget {
	pub fn flattened(target_id: TargetId) -> Self {
		Self {
			target_id,
			flatten: Some(true),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetResponse {
	pub session_id: SessionId,
}

impl Command for AttachToTarget {
	const METHOD: &'static str = "Target.attachToTarget";
	type Response = AttachToTargetResponse;
}

/// Detaches the given session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachFromTarget {
	pub session_id: SessionId,
}

impl Command for DetachFromTarget {
	const METHOD: &'static str = "Target.detachFromTarget";
	type Response = Empty;
}

/// Controls whether new related targets are attached automatically.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAutoAttach {
	pub auto_attach: bool,
	pub wait_for_debugger_on_start: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub flatten: Option<bool>,
}

impl Command for SetAutoAttach {
	const METHOD: &'static str = "Target.setAutoAttach";
	type Response = Empty;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GetTargets {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTargetsResponse {
	pub target_infos: Vec<TargetInfo>,
}

impl Command for GetTargets {
	const METHOD: &'static str = "Target.getTargets";
	type Response = GetTargetsResponse;
}

/// Pushed when a session is attached, including auto-attached targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTarget {
	pub session_id: SessionId,
	pub target_info: TargetInfo,
	#[serde(default)]
	pub waiting_for_debugger: bool,
}

impl EventType for AttachedToTarget {
	const METHOD: &'static str = "Target.attachedToTarget";
}

/// Pushed when a session is detached, whoever initiated it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTarget {
	pub session_id: SessionId,
	#[serde(default)]
	pub target_id: Option<TargetId>,
}

impl EventType for DetachedFromTarget {
	const METHOD: &'static str = "Target.detachedFromTarget";
}
