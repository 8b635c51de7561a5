//! # Library Call Recognition
//!
//! Calls into code we know does not retain its pointer arguments are not
//! escapes, and need no escape checks on their arguments. Which calls
//! qualify is a policy decision behind [`LibraryCallOracle`].

use std::collections::BTreeSet;

use crate::ir::Callee;
use crate::runtime::RuntimeFn;

/// Decides whether a call targets a recognized library routine or intrinsic.
pub trait LibraryCallOracle {
    /// Is `callee` a library call?
    fn is_library_call(&self, callee: &Callee) -> bool;
}

/// Prefix of compiler intrinsics.
pub const INTRINSIC_PREFIX: &str = "llvm.";

/// C library routines recognized out of the box.
const LIBC_FUNCTIONS: &[&str] = &[
    // stdio
    "printf", "fprintf", "sprintf", "snprintf", "vprintf", "vfprintf", "vsnprintf",
    "scanf", "sscanf", "fscanf", "puts", "fputs", "putchar", "fputc", "fgets", "fgetc",
    "getchar", "fopen", "fclose", "fread", "fwrite", "fflush", "fseek", "ftell", "perror",
    // string
    "memcpy", "memmove", "memset", "memcmp", "memchr", "strlen", "strnlen", "strcpy",
    "strncpy", "strcat", "strncat", "strcmp", "strncmp", "strchr", "strrchr", "strstr",
    "strdup", "strtok",
    // stdlib
    "malloc", "calloc", "realloc", "free", "atoi", "atol", "atof", "strtol", "strtoul",
    "strtod", "abs", "labs", "qsort", "bsearch", "rand", "srand", "exit", "abort", "getenv",
    // math
    "sqrt", "pow", "exp", "log", "sin", "cos", "tan", "floor", "ceil", "fabs", "fmod",
    // ctype
    "isalpha", "isdigit", "isspace", "isupper", "islower", "toupper", "tolower",
    // time
    "time", "clock",
];

/// Benchmark-harness helper treated as a library routine.
const READ_ARGV: &str = "readArgv";

/// The default oracle: intrinsics, libc, the runtime's own entry points and
/// any registered extras.
#[derive(Debug, Clone, Default)]
pub struct KnownLibraryCalls {
    extra: BTreeSet<String>,
}

impl KnownLibraryCalls {
    /// Create the default oracle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recognize an additional function name.
    pub fn register(&mut self, name: impl Into<String>) {
        self.extra.insert(name.into());
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_extra<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.register(name);
        }
        self
    }

    /// Is `name` a recognized library function?
    pub fn is_library_function(&self, name: &str) -> bool {
        name.starts_with(INTRINSIC_PREFIX)
            || LIBC_FUNCTIONS.contains(&name)
            || RuntimeFn::from_symbol(name).is_some()
            || name == READ_ARGV
            || self.extra.contains(name)
    }

    /// Every recognized name, sorted. Intrinsics are listed by prefix.
    pub fn names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = LIBC_FUNCTIONS.iter().map(|s| s.to_string()).collect();
        names.extend(RuntimeFn::ALL.iter().map(|f| f.symbol().to_string()));
        names.insert(READ_ARGV.to_string());
        names.insert(format!("{INTRINSIC_PREFIX}*"));
        names.extend(self.extra.iter().cloned());
        names.into_iter().collect()
    }
}

impl LibraryCallOracle for KnownLibraryCalls {
    fn is_library_call(&self, callee: &Callee) -> bool {
        match callee {
            Callee::Direct(name) => self.is_library_function(name),
            Callee::Indirect(_) => false,
        }
    }
}
