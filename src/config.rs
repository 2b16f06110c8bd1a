//! Options controlling which hooks a module is instrumented with.

/// How the target program is instrumented when several tools are configured
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[repr(C)]
pub enum TargetInstrumentation {
    /// Only the first tool in the list observes the target program
    #[default]
    FirstToolOnly,
    /// Every tool observes the target program, through a multiplexer
    Multiplex,
}

/// How the tools themselves are instrumented
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[repr(C)]
pub enum ComposeFunction {
    /// Tools are never instrumented
    #[default]
    DontCompose,
    /// Every tool is instrumented by the one following it in the list
    Chained,
}

/// What a module is, as far as instrumentation is concerned
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ModuleRole {
    /// The program being observed
    Target,
    /// The tool at this position of the tool list
    Tool(usize),
}

/// The instrumentation configuration. Fixed once constructed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstrumentConfig {
    tools: Vec<String>,
    target_instrumentation: TargetInstrumentation,
    compose_function: ComposeFunction,
}

impl InstrumentConfig {
    pub fn new(
        tools: impl IntoIterator<Item = impl Into<String>>,
        target_instrumentation: TargetInstrumentation,
        compose_function: ComposeFunction) -> Self {

        InstrumentConfig {
            tools: tools.into_iter().map(Into::into).collect(),
            target_instrumentation,
            compose_function
        }
    }

    /// The tool names, in the order they were given
    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    /// The effective target instrumentation.
    ///
    /// There's nothing to multiplex with less than two tools,
    /// so `Multiplex` falls back to `FirstToolOnly` then.
    pub fn target_instrumentation(&self) -> TargetInstrumentation {
        if self.tools.len() < 2 {
            TargetInstrumentation::FirstToolOnly
        } else {
            self.target_instrumentation
        }
    }

    pub fn compose_function(&self) -> ComposeFunction {
        self.compose_function
    }

    /// A module is the tool whose name is equal to the module name, the first one if
    /// a name is listed twice. Everything else is the target program.
    pub fn role_of(&self, module_name: &str) -> ModuleRole {
        match self.tools.iter().position(|tool| tool == module_name) {
            Some(idx) => ModuleRole::Tool(idx),
            None => ModuleRole::Target,
        }
    }

    /// The tool following `idx` in the list, if there's one
    pub fn next_tool(&self, idx: usize) -> Option<&str> {
        self.tools.get(idx + 1).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::{ComposeFunction, InstrumentConfig, ModuleRole, TargetInstrumentation};

    #[test]
    fn multiplex_needs_two_tools() {
        let single = InstrumentConfig::new(["time.cpp"], TargetInstrumentation::Multiplex, ComposeFunction::DontCompose);
        assert_eq!(single.target_instrumentation(), TargetInstrumentation::FirstToolOnly);

        let two = InstrumentConfig::new(["time.cpp", "log.c"], TargetInstrumentation::Multiplex, ComposeFunction::DontCompose);
        assert_eq!(two.target_instrumentation(), TargetInstrumentation::Multiplex);
    }

    #[test]
    fn role_is_found_by_exact_name() {
        let config = InstrumentConfig::new(["a.c", "b.c", "a.c"], TargetInstrumentation::FirstToolOnly, ComposeFunction::Chained);
        assert_eq!(config.role_of("a.c"), ModuleRole::Tool(0));
        assert_eq!(config.role_of("b.c"), ModuleRole::Tool(1));
        assert_eq!(config.role_of("./a.c"), ModuleRole::Target);
        assert_eq!(config.next_tool(0), Some("b.c"));
        assert_eq!(config.next_tool(2), None);
    }
}
