//! Topic resolution for message types.
//!
//! A [`MessageType`] is the logical identifier of a message: a dotted
//! namespace, a name and zero or more generic arguments. [`TopicNames`] maps
//! it to the routing topic used for subscriptions and multicast publishing by
//! running an ordered chain of [`TopicResolver`]s; the first one returning a
//! topic wins, and the type's pretty-printed name is the fallback.

use std::fmt;

/// Logical identifier of a message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType {
    namespace: String,
    name: String,
    arguments: Vec<MessageType>,
}

impl MessageType {
    /// Create a non-generic type. `namespace` uses `.` as separator and may be empty.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            arguments: Vec::new(),
        }
    }

    /// Add generic arguments.
    pub fn with_arguments(mut self, arguments: impl IntoIterator<Item = MessageType>) -> Self {
        self.arguments.extend(arguments);
        self
    }

    /// Identifier of a Rust type, derived from [`std::any::type_name`].
    ///
    /// Path separators become `.` and generic parameters become arguments:
    /// `app::events::Envelope<app::Order>` has namespace `app.events`, name
    /// `Envelope` and one argument `app.Order`.
    pub fn of<T: ?Sized>() -> Self {
        Self::parse(std::any::type_name::<T>())
    }

    /// Parse a Rust type path such as `a::b::C<d::E, F>`.
    pub fn parse(type_name: &str) -> Self {
        parse_type(type_name.trim()).0
    }

    /// Dotted namespace, possibly empty.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Unqualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generic arguments in declaration order.
    pub fn arguments(&self) -> &[MessageType] {
        &self.arguments
    }

    /// Whether the type has generic arguments.
    pub fn is_generic(&self) -> bool {
        !self.arguments.is_empty()
    }

    /// `Namespace.Name`, without generic arguments.
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// `Namespace.Name<Arg1, Arg2>` with arguments printed recursively.
    pub fn pretty_name(&self) -> String {
        if !self.is_generic() {
            return self.full_name();
        }
        let arguments: Vec<String> = self.arguments.iter().map(Self::pretty_name).collect();
        format!("{}<{}>", self.full_name(), arguments.join(", "))
    }

    fn from_path(path: &str) -> Self {
        if path.contains(['(', '[', '&', ' ']) {
            return Self::new("", path);
        }
        match path.rsplit_once("::") {
            Some((namespace, name)) => Self::new(namespace.replace("::", "."), name),
            None => Self::new("", path),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty_name())
    }
}

fn parse_type(input: &str) -> (MessageType, &str) {
    let mut depth = 0usize;
    let mut end = input.len();
    for (index, ch) in input.char_indices() {
        match ch {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '<' | ',' | '>' if depth == 0 => {
                end = index;
                break;
            }
            _ => {}
        }
    }

    let mut message_type = MessageType::from_path(input[..end].trim());
    let mut rest = &input[end..];

    if let Some(after) = rest.strip_prefix('<') {
        rest = after;
        loop {
            let (argument, after) = parse_type(rest.trim_start());
            message_type.arguments.push(argument);
            rest = after.trim_start();
            if let Some(after) = rest.strip_prefix(',') {
                rest = after;
                continue;
            }
            rest = rest.strip_prefix('>').unwrap_or(rest);
            break;
        }
    }

    (message_type, rest)
}

/// Strategy mapping a message type to a topic.
///
/// Returning `None` defers to the next resolver in the chain.
pub trait TopicResolver: Send + Sync {
    /// Topic for `message_type`, if this resolver handles it.
    fn resolve(&self, message_type: &MessageType) -> Option<String>;
}

impl<F> TopicResolver for F
where
    F: Fn(&MessageType) -> Option<String> + Send + Sync,
{
    fn resolve(&self, message_type: &MessageType) -> Option<String> {
        self(message_type)
    }
}

/// Ordered resolver chain with a pretty-printed fallback.
#[derive(Default)]
pub struct TopicNames {
    resolvers: Vec<Box<dyn TopicResolver>>,
}

impl TopicNames {
    /// Chain with no resolvers; every type maps to its pretty name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolver, consulted after the ones already registered.
    pub fn with_resolver(mut self, resolver: impl TopicResolver + 'static) -> Self {
        self.register(resolver);
        self
    }

    /// Append a resolver, consulted after the ones already registered.
    pub fn register(&mut self, resolver: impl TopicResolver + 'static) {
        self.resolvers.push(Box::new(resolver));
    }

    /// Number of registered resolvers.
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// Whether no resolvers are registered.
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Topic for a message type.
    pub fn resolve(&self, message_type: &MessageType) -> String {
        self.resolvers
            .iter()
            .find_map(|resolver| resolver.resolve(message_type))
            .unwrap_or_else(|| message_type.pretty_name())
    }
}
