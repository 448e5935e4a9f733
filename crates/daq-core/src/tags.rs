//! Tag vocabulary for field metadata.
//!
//! Tags are plain strings attached to attribute and method metas. Everything
//! here is a pure function over a tag slice: an absent tag always means the
//! plain default (not unpacked, no widget, no group, not saved in a design).
//!
//! | Tag                          | Meaning                                        |
//! |------------------------------|------------------------------------------------|
//! | `method:return:unpacked`     | single return value travels bare               |
//! | `group:<name>`               | field is displayed inside group `<name>`       |
//! | `config:<iteration>`         | field is saved into designs, restored in order |
//! | `widget:<kind>`              | preferred widget for display/editing           |
//! | `sinkPort:<port>:<value>`    | attribute accepts a connection of type port   |
//! | `outport:<port>:<value>`     | attribute publishes a connection of type port |

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Marks a method whose single return element is sent without its record.
pub const METHOD_RETURN_UNPACKED: &str = "method:return:unpacked";

/// True if the tag set marks an unpacked single return.
pub fn is_method_return_unpacked(tags: &[String]) -> bool {
    tags.iter().any(|t| t == METHOD_RETURN_UNPACKED)
}

// =============================================================================
// Groups
// =============================================================================

/// Tag placing a field inside the named group.
pub fn group_tag(group_name: &str) -> String {
    format!("group:{group_name}")
}

/// Group the tag set places its field in, if any.
pub fn get_group(tags: &[String]) -> Option<&str> {
    tags.iter().find_map(|t| t.strip_prefix("group:"))
}

/// Copy of `tags` with every group tag removed.
pub fn without_group_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .filter(|t| !t.starts_with("group:"))
        .cloned()
        .collect()
}

// =============================================================================
// Config
// =============================================================================

/// Tag marking a field as saved in designs, restored at `iteration`.
pub fn config_tag(iteration: u32) -> String {
    format!("config:{iteration}")
}

/// Restore iteration of a config-tagged field.
pub fn get_config_tag(tags: &[String]) -> Option<u32> {
    tags.iter()
        .find_map(|t| t.strip_prefix("config:"))
        .and_then(|s| s.parse().ok())
}

// =============================================================================
// Widgets
// =============================================================================

/// Preferred display widget for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Widget {
    /// Editable text box.
    TextInput,
    /// Read-only text.
    TextUpdate,
    /// Multi-line read-only text.
    MultilineTextUpdate,
    /// On/off indicator.
    Led,
    /// Drop-down choice.
    Combo,
    /// Tick box.
    Checkbox,
    /// Tabular editor.
    Table,
    /// Expandable group.
    Group,
    /// Block graph.
    FlowGraph,
    /// Title of a block.
    Title,
    /// Icon of a block.
    Icon,
    /// Link to documentation.
    Help,
    /// Analogue meter.
    Meter,
    /// Progress bar.
    ProgressBar,
}

impl Widget {
    const ALL: [Widget; 14] = [
        Widget::TextInput,
        Widget::TextUpdate,
        Widget::MultilineTextUpdate,
        Widget::Led,
        Widget::Combo,
        Widget::Checkbox,
        Widget::Table,
        Widget::Group,
        Widget::FlowGraph,
        Widget::Title,
        Widget::Icon,
        Widget::Help,
        Widget::Meter,
        Widget::ProgressBar,
    ];

    fn name(self) -> &'static str {
        match self {
            Widget::TextInput => "textinput",
            Widget::TextUpdate => "textupdate",
            Widget::MultilineTextUpdate => "multilinetextupdate",
            Widget::Led => "led",
            Widget::Combo => "combo",
            Widget::Checkbox => "checkbox",
            Widget::Table => "table",
            Widget::Group => "group",
            Widget::FlowGraph => "flowgraph",
            Widget::Title => "title",
            Widget::Icon => "icon",
            Widget::Help => "help",
            Widget::Meter => "meter",
            Widget::ProgressBar => "progressbar",
        }
    }

    /// Tag string for this widget.
    pub fn tag(self) -> String {
        format!("widget:{}", self.name())
    }

    /// Widget a tag set asks for, if any.
    pub fn from_tags(tags: &[String]) -> Option<Widget> {
        tags.iter()
            .filter_map(|t| t.strip_prefix("widget:"))
            .find_map(|name| Widget::ALL.into_iter().find(|w| w.name() == name))
    }

    /// Default widget for an attribute of the given writeability.
    pub fn for_attribute(writeable: bool) -> Widget {
        if writeable {
            Widget::TextInput
        } else {
            Widget::TextUpdate
        }
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Connection type between blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Port {
    /// Boolean signal.
    Bool,
    /// Integer signal.
    Int32,
    /// Named motor axis.
    Motor,
    /// Pulse-counting hardware link.
    Block,
    /// Detector frame stream.
    NdArray,
}

impl Port {
    fn name(self) -> &'static str {
        match self {
            Port::Bool => "bool",
            Port::Int32 => "int32",
            Port::Motor => "motor",
            Port::Block => "block",
            Port::NdArray => "ndarray",
        }
    }

    fn parse(name: &str) -> Option<Port> {
        [Port::Bool, Port::Int32, Port::Motor, Port::Block, Port::NdArray]
            .into_iter()
            .find(|p| p.name() == name)
    }

    /// Tag for an attribute that accepts this port; `disconnected` is the
    /// value it holds when unlinked.
    pub fn sink_port_tag(self, disconnected: &str) -> String {
        format!("sinkPort:{}:{}", self.name(), disconnected)
    }

    /// Tag for an attribute that publishes this port as `value`.
    pub fn source_port_tag(self, value: &str) -> String {
        format!("outport:{}:{}", self.name(), value)
    }
}

static PORT_TAG: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(sinkPort|outport):([a-z0-9]+):(.*)$").ok());

/// A parsed port tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTag {
    /// True for `outport`, false for `sinkPort`.
    pub is_source: bool,
    /// Connection type.
    pub port: Port,
    /// Disconnected value for sinks, published value for sources.
    pub value: String,
}

/// First port tag in `tags`, if any.
pub fn port_tag_details(tags: &[String]) -> Option<PortTag> {
    let re = PORT_TAG.as_ref()?;
    tags.iter().find_map(|tag| {
        let caps = re.captures(tag)?;
        Some(PortTag {
            is_source: &caps[1] == "outport",
            port: Port::parse(&caps[2])?,
            value: caps[3].to_string(),
        })
    })
}

/// Replace any source port tag in `tags` with one publishing `value`.
pub fn with_source_port_tag(tags: &[String], port: Port, value: &str) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .filter(|t| !t.starts_with("outport:"))
        .cloned()
        .collect();
    out.push(port.source_port_tag(value));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_tags_mean_defaults() {
        let none: Vec<String> = Vec::new();
        assert!(!is_method_return_unpacked(&none));
        assert_eq!(Widget::from_tags(&none), None);
        assert_eq!(get_group(&none), None);
        assert_eq!(get_config_tag(&none), None);
        assert_eq!(port_tag_details(&none), None);
    }

    #[test]
    fn group_and_config_tags() {
        let t = tags(&["group:outputs", "config:2", "widget:textinput"]);
        assert_eq!(get_group(&t), Some("outputs"));
        assert_eq!(get_config_tag(&t), Some(2));
        assert_eq!(Widget::from_tags(&t), Some(Widget::TextInput));
        assert_eq!(without_group_tags(&t), tags(&["config:2", "widget:textinput"]));
        assert_eq!(group_tag("outputs"), "group:outputs");
        assert_eq!(config_tag(1), "config:1");
    }

    #[test]
    fn port_tags_parse() {
        let t = tags(&[&Port::Motor.sink_port_tag("")]);
        let details = port_tag_details(&t).unwrap();
        assert!(!details.is_source);
        assert_eq!(details.port, Port::Motor);
        assert_eq!(details.value, "");

        let t = with_source_port_tag(&tags(&["outport:bool:OLD", "widget:led"]), Port::Bool, "ZERO");
        assert_eq!(t, tags(&["widget:led", "outport:bool:ZERO"]));
        assert!(port_tag_details(&t).unwrap().is_source);
    }
}
