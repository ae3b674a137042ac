//! Contracts for the subsystems the core consumes but does not own: the
//! disassembler, the symbolicator, the convenience-variable store, the
//! expression evaluator, the documentation store, user interaction, and the
//! tracing sink. The no-op defaults keep the core runnable without them.

/// Appends textual disassembly of `nbytes` starting at `addr`.
pub trait Disassembler: Send + Sync {
    fn disassemble(&self, addr: u64, nbytes: u32, out: &mut String);
}

/// Best-effort symbolic names for PCs; may append nothing.
pub trait Symbolicator: Send + Sync {
    fn create_frame_string(&self, addr: u64, out: &mut String);

    /// Initializes the inferior's loader image list after attach.
    fn init_images(&self) -> Result<(), String>;
}

/// The convenience-variable store ($ASLR, $_exitcode, numbered results, ...).
pub trait ConvVars: Send + Sync {
    fn set(&self, name: &str, value: &str) -> Result<(), String>;
    fn void(&self, name: &str);
}

/// Yes/no questions put to the user before destructive operations.
pub trait Interaction: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// The expression evaluator, treated as an oracle from string to integer.
pub trait ExprEvaluator: Send + Sync {
    fn eval(&self, expr: &str) -> Result<i64, String>;
}

/// Help text owned by the REPL side.
pub trait DocumentationStore: Send + Sync {
    /// `None` asks for the top-level command listing.
    fn for_command(&self, cmd: Option<&str>, out: &mut String) -> Result<(), String>;
}

/// The kdebug-based tracing sink.
pub trait TraceSink: Send + Sync {
    fn supported(&self) -> bool;
    fn start(&self);
    fn stop(&self);
    /// Finish printing everything in flight so exception output does not get
    /// caught in the middle of it.
    fn wait_until_idle(&self);
}

pub struct Collaborators {
    pub disassembler: Box<dyn Disassembler>,
    pub symbolicator: Box<dyn Symbolicator>,
    pub convvars: Box<dyn ConvVars>,
    pub interaction: Box<dyn Interaction>,
    pub evaluator: Box<dyn ExprEvaluator>,
    pub docs: Box<dyn DocumentationStore>,
    pub trace: Box<dyn TraceSink>,
}

struct Nop;

impl Disassembler for Nop {
    fn disassemble(&self, _addr: u64, _nbytes: u32, _out: &mut String) {}
}

impl Symbolicator for Nop {
    fn create_frame_string(&self, _addr: u64, _out: &mut String) {}

    fn init_images(&self) -> Result<(), String> {
        Ok(())
    }
}

impl ConvVars for Nop {
    fn set(&self, _name: &str, _value: &str) -> Result<(), String> {
        Ok(())
    }

    fn void(&self, _name: &str) {}
}

impl Interaction for Nop {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

impl ExprEvaluator for Nop {
    fn eval(&self, expr: &str) -> Result<i64, String> {
        Err(format!("no evaluator wired up for {}", expr))
    }
}

impl DocumentationStore for Nop {
    fn for_command(&self, cmd: Option<&str>, _out: &mut String) -> Result<(), String> {
        match cmd {
            Some(cmd) => Err(format!("no documentation for {}", cmd)),
            None => Ok(()),
        }
    }
}

impl TraceSink for Nop {
    fn supported(&self) -> bool {
        false
    }

    fn start(&self) {}

    fn stop(&self) {}

    fn wait_until_idle(&self) {}
}

impl Default for Collaborators {
    fn default() -> Collaborators {
        Collaborators {
            disassembler: Box::new(Nop),
            symbolicator: Box::new(Nop),
            convvars: Box::new(Nop),
            interaction: Box::new(Nop),
            evaluator: Box::new(Nop),
            docs: Box::new(Nop),
            trace: Box::new(Nop),
        }
    }
}
