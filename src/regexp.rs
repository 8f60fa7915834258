use regex::{Regex, RegexBuilder};

/// A registry host component: dotted DNS labels (or `localhost`, or an IPv4
/// address) with an optional port. Anchored.
pub const HOST_REGEXP: &str = r"^(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?$";

/// A single path component of a repository name. Separators may only appear
/// between alphanumeric runs. Anchored.
pub const PATH_COMPONENT_REGEXP: &str = r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$";

/// Upper bound on the length of a remote name, as enforced by registries.
pub const NAME_TOTAL_LENGTH_MAX: usize = 255;

lazy_static! {
    pub static ref HOST: Regex = must_compile(HOST_REGEXP);
    pub static ref PATH_COMPONENT: Regex = must_compile(PATH_COMPONENT_REGEXP);
}

fn must_compile(r: &str) -> Regex {
    RegexBuilder::new(r)
        .size_limit(10 * (1 << 21))
        .build()
        .unwrap()
}
