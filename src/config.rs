//! Environment-derived configuration, centralized rather than read ad hoc from
//! the modules that need it.

use std::env;

use tracing::warn;

const DEFAULT_MIDI_PORTS: &str = "DISABLED_IN=\\nENABLED_OUT=ttymidi:MIDI_out\\nENABLED_FB=";

/// Hardware/external MIDI routing policy, parsed from `ZYNTHIAN_MIDI_PORTS`
/// and `ZYNTHIAN_MIDI_FILTER_OUTPUT`.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// `ZYNTHIAN_MIDI_FILTER_OUTPUT=1` restricts `External`-destination output
    /// to the ports named in `ENABLED_OUT`. Unset/invalid means "don't filter".
    pub filter_output: bool,
    /// Hardware input ports (`DISABLED_IN`) that should never be read from,
    /// regardless of `filter_output`.
    pub disabled_in_ports: Vec<String>,
    /// External output ports (`ENABLED_OUT`) eligible for `External`-destination
    /// channels to connect to.
    pub enabled_out_ports: Vec<String>,
    /// Feedback ports (`ENABLED_FB`). Parsed and retained, but not yet wired to
    /// any behaviour.
    pub enabled_fb_ports: Vec<String>,
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let filter_output = match env::var("ZYNTHIAN_MIDI_FILTER_OUTPUT") {
            Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
            Err(_) => false,
        };
        let raw = match env::var("ZYNTHIAN_MIDI_PORTS") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => DEFAULT_MIDI_PORTS.to_string(),
        };
        Self::parse(filter_output, &raw)
    }

    /// `ZYNTHIAN_MIDI_PORTS` is three keyed, comma-separated sub-lists joined
    /// by the literal two-character sequence `\n` (matching the original's own
    /// `QString::split("\\n")`, not an actual newline byte):
    /// `"DISABLED_IN=a,b\nENABLED_OUT=c\nENABLED_FB="`.
    fn parse(filter_output: bool, raw: &str) -> Self {
        let mut config = Self { filter_output, ..Default::default() };
        for entry in raw.split("\\n") {
            if entry.is_empty() {
                continue;
            }
            let Some((key, value)) = entry.split_once('=') else {
                warn!(entry, "ZYNTHIAN_MIDI_PORTS: malformed entry, expected KEY=value");
                continue;
            };
            let values: Vec<String> =
                value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            match key {
                "DISABLED_IN" => config.disabled_in_ports = values,
                "ENABLED_OUT" => config.enabled_out_ports = values,
                "ENABLED_FB" => config.enabled_fb_ports = values,
                other => warn!(key = other, "ZYNTHIAN_MIDI_PORTS: unknown key"),
            }
        }
        if filter_output && config.enabled_out_ports.is_empty() {
            warn!("ZYNTHIAN_MIDI_FILTER_OUTPUT is set but ENABLED_OUT is empty, falling back to allow-all");
            config.filter_output = false;
        }
        config
    }

    /// Whether a hardware input port should be read from at all.
    pub fn port_allowed(&self, name: &str) -> bool {
        !self.disabled_in_ports.iter().any(|p| p == name)
    }

    /// Whether `External`-destination output is allowed to reach `name`.
    pub fn external_output_allowed(&self, name: &str) -> bool {
        !self.filter_output || self.enabled_out_ports.iter().any(|p| p == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_everything_when_not_filtering() {
        let cfg = RouterConfig::parse(false, "DISABLED_IN=\\nENABLED_OUT=\\nENABLED_FB=");
        assert!(cfg.port_allowed("anything"));
        assert!(cfg.external_output_allowed("anything"));
    }

    #[test]
    fn disabled_in_blocks_hardware_input_regardless_of_filter_output() {
        let cfg = RouterConfig::parse(false, "DISABLED_IN=hw:in1,hw:in2\\nENABLED_OUT=\\nENABLED_FB=");
        assert!(!cfg.port_allowed("hw:in1"));
        assert!(cfg.port_allowed("hw:in3"));
    }

    #[test]
    fn restricts_external_output_to_enabled_out_when_filtering() {
        let cfg = RouterConfig::parse(true, "DISABLED_IN=\\nENABLED_OUT=ttymidi:MIDI_in\\nENABLED_FB=");
        assert!(cfg.external_output_allowed("ttymidi:MIDI_in"));
        assert!(!cfg.external_output_allowed("other:port"));
    }

    #[test]
    fn three_keyed_sublists_parse_independently() {
        let cfg = RouterConfig::parse(
            false,
            "DISABLED_IN=a,b\\nENABLED_OUT=c,d\\nENABLED_FB=e",
        );
        assert_eq!(cfg.disabled_in_ports, vec!["a", "b"]);
        assert_eq!(cfg.enabled_out_ports, vec!["c", "d"]);
        assert_eq!(cfg.enabled_fb_ports, vec!["e"]);
    }

    #[test]
    fn falls_back_to_allow_all_when_filter_requested_but_enabled_out_empty() {
        let cfg = RouterConfig::parse(true, "DISABLED_IN=\\nENABLED_OUT=\\nENABLED_FB=");
        assert!(!cfg.filter_output);
    }
}
