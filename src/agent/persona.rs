use serde_json::{json, Value};

pub const RECEPTIONIST: &str = "receptionist";
pub const FINANCIAL_SPECIALIST: &str = "financial_specialist";

/// A named configuration of instructions and tools bound to the realtime
/// session. A call starts on the receptionist and may hand off in-session;
/// the audio socket never changes hands.
#[derive(Debug, Clone)]
pub struct Persona {
    pub name: String,
    pub instructions: String,
    pub tools: Vec<Value>,
}

/// Look up a persona by name, wiring in the handoff targets it may switch
/// to. Unknown names return None so a hallucinated handoff fails cleanly.
pub fn by_name(name: &str, handoff_targets: &[String]) -> Option<Persona> {
    match name {
        RECEPTIONIST => Some(receptionist(handoff_targets)),
        FINANCIAL_SPECIALIST => Some(financial_specialist(handoff_targets)),
        _ => None,
    }
}

pub fn receptionist(handoff_targets: &[String]) -> Persona {
    Persona {
        name: RECEPTIONIST.to_string(),
        instructions: "You are the front-desk receptionist answering this phone line. \
             Greet callers warmly, answer general questions and route them. For privileged \
             financial questions, hand the conversation off to the financial specialist. \
             When a caller asks for a human or a department you cannot help with, use the \
             transfer_call tool. If a transfer fails, apologize and offer to take a message \
             or schedule a callback."
            .to_string(),
        tools: default_tools(handoff_targets),
    }
}

pub fn financial_specialist(handoff_targets: &[String]) -> Persona {
    Persona {
        name: FINANCIAL_SPECIALIST.to_string(),
        instructions: "You are the financial specialist for this line. The receptionist \
             handed the caller to you for privileged financial queries; the caller is already \
             on the line, continue the conversation without re-greeting from scratch. Hand back \
             to the receptionist for anything outside finance. If a transfer fails, apologize \
             and offer to take a message or schedule a callback."
            .to_string(),
        tools: default_tools(handoff_targets),
    }
}

fn default_tools(handoff_targets: &[String]) -> Vec<Value> {
    let mut tools = vec![transfer_call_tool()];
    if !handoff_targets.is_empty() {
        tools.push(handoff_tool(handoff_targets));
    }
    tools
}

/// Tool surface of the Transfer Coordinator: the only way a transfer is
/// ever requested.
pub fn transfer_call_tool() -> Value {
    json!({
        "type": "function",
        "name": "transfer_call",
        "description": "Transfer the active call to a human-staffed phone number. \
            Use only when the caller needs a person or department you cannot help with.",
        "parameters": {
            "type": "object",
            "properties": {
                "target_address": {
                    "type": "string",
                    "description": "Destination phone number in E.164 format, e.g. +390200000000"
                },
                "reason": {
                    "type": "string",
                    "description": "Short reason for the transfer, e.g. 'technical support'"
                }
            },
            "required": ["target_address", "reason"]
        }
    })
}

/// In-session persona switch; swaps instructions and tools on the live
/// session without touching the audio socket.
pub fn handoff_tool(targets: &[String]) -> Value {
    json!({
        "type": "function",
        "name": "handoff",
        "description": "Hand the conversation off to another agent persona on the same call.",
        "parameters": {
            "type": "object",
            "properties": {
                "target": {
                    "type": "string",
                    "enum": targets,
                    "description": "Persona to hand the caller to"
                }
            },
            "required": ["target"]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_name_known_personas() {
        let targets = vec![FINANCIAL_SPECIALIST.to_string()];
        let persona = by_name(RECEPTIONIST, &targets).unwrap();
        assert_eq!(persona.name, RECEPTIONIST);
        assert_eq!(persona.tools.len(), 2);

        assert!(by_name("butler", &targets).is_none());
    }

    #[test]
    fn test_handoff_tool_lists_targets() {
        let targets = vec![FINANCIAL_SPECIALIST.to_string()];
        let tool = handoff_tool(&targets);
        let enum_values = tool["parameters"]["properties"]["target"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(enum_values.len(), 1);
        assert_eq!(enum_values[0], FINANCIAL_SPECIALIST);
    }

    #[test]
    fn test_no_handoff_tool_without_targets() {
        let persona = receptionist(&[]);
        assert_eq!(persona.tools.len(), 1);
        assert_eq!(persona.tools[0]["name"], "transfer_call");
    }
}
