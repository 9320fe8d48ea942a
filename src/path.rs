//! Path Addressing
//!
//! Dotted addresses into nested structures. A user-facing address names nodes and
//! their inputs directly (`"osc.freq"`); the internal storage address interleaves an
//! `inputs` marker at every non-numeric boundary (`"osc.inputs.freq"`).
//!
//! Paths are ordered sequences of typed [`Segment`]s, resolved by one small
//! interpreter ([`get`], [`set`], [`invoke`]) against anything implementing
//! [`Addressable`]. Back-ends exist for `serde_json::Value`, for a synth's
//! [`NodeCache`](crate::graph::NodeCache) and for the unit generator registry.

use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// The marker segment separating a node from its named inputs
pub const INPUTS_MARKER: &str = "inputs";

/// One segment of a [`Path`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A named field: a node identifier or an input name
    Field(String),
    /// The graph-input marker
    Inputs,
    /// A position in a list
    Index(usize),
}

impl Segment {
    fn classify(token: &str) -> Self {
        if token == INPUTS_MARKER {
            Segment::Inputs
        } else {
            Self::field_or_index(token)
        }
    }

    fn field_or_index(token: &str) -> Self {
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = token.parse() {
                return Segment::Index(index);
            }
        }
        Segment::Field(token.to_string())
    }

    /// The segment as a map key
    pub fn key(&self) -> String {
        match self {
            Segment::Field(name) => name.clone(),
            Segment::Inputs => INPUTS_MARKER.to_string(),
            Segment::Index(index) => index.to_string(),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => f.write_str(name),
            Segment::Inputs => f.write_str(INPUTS_MARKER),
            Segment::Index(index) => write!(f, "{}", index),
        }
    }
}

/// An address into a nested structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    /// Parse an internal (already expanded) address
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            return Self::default();
        }
        Self {
            segments: path.split('.').map(Segment::classify).collect(),
        }
    }

    /// Parse a user-facing address, inserting the inputs marker before every
    /// non-numeric segment after the first
    pub fn expand(path: &str) -> Self {
        if path.is_empty() {
            return Self::default();
        }
        let mut segments = Vec::new();
        for (i, token) in path.split('.').enumerate() {
            let segment = Segment::field_or_index(token);
            if i > 0 && !matches!(segment, Segment::Index(_)) {
                segments.push(Segment::Inputs);
            }
            segments.push(segment);
        }
        Self { segments }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// The node owning the input this path ends in, with the input's name.
    ///
    /// `osc.inputs.freq` is owned by `osc` under `freq`; a bare `osc` has no owner.
    pub fn owner(&self) -> Option<(Path, &str)> {
        let marker = self.segments.iter().rposition(|s| *s == Segment::Inputs)?;
        let name = match self.segments.get(marker + 1)? {
            Segment::Field(name) => name.as_str(),
            _ => return None,
        };
        Some((Path::from_segments(self.segments[..marker].to_vec()), name))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

/// Expand a user-facing address into its internal form
pub fn expand_path(path: &str) -> String {
    Path::expand(path).to_string()
}

/// Expand every key of a path-keyed map
pub fn expand_paths<V>(paths: impl IntoIterator<Item = (String, V)>) -> BTreeMap<String, V> {
    paths
        .into_iter()
        .map(|(path, value)| (expand_path(&path), value))
        .collect()
}

/// A structure the path interpreter can walk
pub trait Addressable {
    /// A location within the structure
    type Cursor: Clone;
    /// What reading a location yields
    type Value;

    fn root(&self) -> Self::Cursor;

    /// Step from `at` through `segment`, or `None` if nothing is there
    fn descend(&self, at: &Self::Cursor, segment: &Segment) -> Option<Self::Cursor>;

    fn read(&self, at: &Self::Cursor) -> Option<Self::Value>;
}

/// A structure the path interpreter can write into
pub trait AddressableMut: Addressable {
    fn is_container(&self, at: &Self::Cursor) -> bool;

    /// Create an empty container under `at`. `None` if the structure cannot.
    fn create(&mut self, at: &Self::Cursor, segment: &Segment) -> Option<Self::Cursor>;

    /// Store `value` under `segment` of the container at `at`. Returns `false`
    /// when `at` cannot hold it.
    fn write(&mut self, at: &Self::Cursor, segment: &Segment, value: Self::Value) -> bool;

    /// Whether [`write`](AddressableMut::write) would accept `value` here
    fn can_write(&self, at: &Self::Cursor, _segment: &Segment, _value: &Self::Value) -> bool {
        self.is_container(at)
    }
}

/// A structure whose locations may hold functions
pub trait Callable: Addressable {
    type Args: ?Sized;
    type Output;

    /// Call the function at `at`, or `None` if it is not a function
    fn call(&self, at: &Self::Cursor, args: &Self::Args) -> Option<Self::Output>;
}

fn unresolved(path: &Path, segment: &Segment) -> Error {
    Error::Unresolved {
        path: path.to_string(),
        segment: segment.to_string(),
    }
}

fn resolve<T: Addressable + ?Sized>(target: &T, path: &Path) -> Result<Option<T::Cursor>> {
    let mut at = target.root();
    let last = path.segments.len().saturating_sub(1);
    for (i, segment) in path.segments.iter().enumerate() {
        match target.descend(&at, segment) {
            Some(next) => at = next,
            None if i == last => return Ok(None),
            None => return Err(unresolved(path, segment)),
        }
    }
    Ok(Some(at))
}

/// Read the value at `path`.
///
/// A missing final segment yields `Ok(None)`; a missing intermediate segment is an
/// [`Error::Unresolved`].
pub fn get<T: Addressable + ?Sized>(target: &T, path: &Path) -> Result<Option<T::Value>> {
    if path.is_empty() {
        return Ok(None);
    }
    Ok(resolve(target, path)?.and_then(|at| target.read(&at)))
}

/// Write `value` at `path`, creating missing intermediate containers where the
/// structure supports it.
pub fn set<T: AddressableMut + ?Sized>(target: &mut T, path: &Path, value: T::Value) -> Result<()> {
    let Some((last, parents)) = path.segments.split_last() else {
        return Ok(());
    };

    let mut at = target.root();
    for segment in parents {
        at = match target.descend(&at, segment) {
            Some(next) => next,
            None => target
                .create(&at, segment)
                .ok_or_else(|| unresolved(path, segment))?,
        };
        if !target.is_container(&at) {
            return Err(Error::NotAContainer {
                path: path.to_string(),
                segment: segment.to_string(),
            });
        }
    }

    if target.write(&at, last, value) {
        Ok(())
    } else {
        Err(Error::NotAContainer {
            path: path.to_string(),
            segment: parents.last().unwrap_or(last).to_string(),
        })
    }
}

/// Check that [`set`] would store `value` at `path`, without changing anything.
///
/// Missing intermediates are [`Error::Unresolved`] here even where `set` could
/// create them.
pub fn check_set<T: AddressableMut + ?Sized>(target: &T, path: &Path, value: &T::Value) -> Result<()> {
    let Some((last, parents)) = path.segments.split_last() else {
        return Ok(());
    };

    let mut at = target.root();
    for segment in parents {
        at = target
            .descend(&at, segment)
            .ok_or_else(|| unresolved(path, segment))?;
        if !target.is_container(&at) {
            return Err(Error::NotAContainer {
                path: path.to_string(),
                segment: segment.to_string(),
            });
        }
    }

    if target.can_write(&at, last, value) {
        Ok(())
    } else {
        Err(Error::NotAContainer {
            path: path.to_string(),
            segment: parents.last().unwrap_or(last).to_string(),
        })
    }
}

/// Call the function found at `path`
pub fn invoke<T: Callable + ?Sized>(target: &T, path: &Path, args: &T::Args) -> Result<T::Output> {
    let not_callable = || Error::NotCallable {
        path: path.to_string(),
    };
    if path.is_empty() {
        return Err(not_callable());
    }
    let at = resolve(target, path)?.ok_or_else(not_callable)?;
    target.call(&at, args).ok_or_else(not_callable)
}

// JSON documents are addressed through JSON pointers.

fn pointer_child(at: &str, segment: &Segment) -> String {
    let key = segment.key().replace('~', "~0").replace('/', "~1");
    format!("{}/{}", at, key)
}

impl Addressable for Value {
    type Cursor = String;
    type Value = Value;

    fn root(&self) -> String {
        String::new()
    }

    fn descend(&self, at: &String, segment: &Segment) -> Option<String> {
        let child = pointer_child(at, segment);
        match self.pointer(&child) {
            Some(Value::Null) | None => None,
            Some(_) => Some(child),
        }
    }

    fn read(&self, at: &String) -> Option<Value> {
        self.pointer(at).cloned()
    }
}

impl AddressableMut for Value {
    fn is_container(&self, at: &String) -> bool {
        matches!(self.pointer(at), Some(Value::Object(_)) | Some(Value::Array(_)))
    }

    fn create(&mut self, at: &String, segment: &Segment) -> Option<String> {
        let empty = Value::Object(Map::new());
        if self.write(at, segment, empty) {
            Some(pointer_child(at, segment))
        } else {
            None
        }
    }

    fn write(&mut self, at: &String, segment: &Segment, value: Value) -> bool {
        match self.pointer_mut(at) {
            Some(Value::Object(map)) => {
                map.insert(segment.key(), value);
                true
            }
            Some(Value::Array(items)) => match segment {
                Segment::Index(i) if *i < items.len() => {
                    items[*i] = value;
                    true
                }
                Segment::Index(i) if *i == items.len() => {
                    items.push(value);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn can_write(&self, at: &String, segment: &Segment, _value: &Value) -> bool {
        match self.pointer(at) {
            Some(Value::Object(_)) => true,
            Some(Value::Array(items)) => matches!(segment, Segment::Index(i) if *i <= items.len()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("osc.freq"), "osc.inputs.freq");
        assert_eq!(expand_path("env.gate"), "env.inputs.gate");
        assert_eq!(expand_path("arr.0.val"), "arr.0.inputs.val");
        assert_eq!(expand_path("osc"), "osc");
        assert_eq!(expand_path("out.sources.1.freq"), "out.inputs.sources.1.inputs.freq");
    }

    #[test]
    fn test_expand_paths_map() {
        let expanded = expand_paths(vec![("env.gate".to_string(), 1.0), ("osc.mul".to_string(), 0.5)]);
        assert_eq!(expanded.get("env.inputs.gate"), Some(&1.0));
        assert_eq!(expanded.get("osc.inputs.mul"), Some(&0.5));
    }

    #[test]
    fn test_parse_segments() {
        let path = Path::parse("out.inputs.sources.2");
        assert_eq!(
            path.segments(),
            &[
                Segment::Field("out".into()),
                Segment::Inputs,
                Segment::Field("sources".into()),
                Segment::Index(2),
            ]
        );
        assert_eq!(path.to_string(), "out.inputs.sources.2");
        assert!(Path::parse("").is_empty());
    }

    #[test]
    fn test_owner() {
        let path = Path::expand("carrier.freq");
        let (owner, name) = path.owner().unwrap();
        assert_eq!(owner.to_string(), "carrier");
        assert_eq!(name, "freq");

        assert!(Path::expand("carrier").owner().is_none());

        // A list element belongs to the node holding the list
        let element = Path::expand("out.sources.0");
        let (owner, name) = element.owner().unwrap();
        assert_eq!(owner.to_string(), "out");
        assert_eq!(name, "sources");
    }

    #[test]
    fn test_get_nested() {
        let root = json!({"a": {"b": {"c": 5}}});
        assert_eq!(get(&root, &Path::parse("a.b.c")).unwrap(), Some(json!(5)));
        assert_eq!(get(&root, &Path::parse("a.b.missing")).unwrap(), None);
        assert_eq!(get(&root, &Path::parse("")).unwrap(), None);
    }

    #[test]
    fn test_get_unresolved_intermediate() {
        let root = json!({"a": {"b": {"c": 5}}});
        let err = get(&root, &Path::parse("a.x.c")).unwrap_err();
        assert_eq!(
            err,
            Error::Unresolved {
                path: "a.x.c".into(),
                segment: "x".into()
            }
        );
    }

    #[test]
    fn test_get_array_index() {
        let root = json!({"arr": [{"val": 1}, {"val": 2}]});
        assert_eq!(get(&root, &Path::parse("arr.1.val")).unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_set_round_trip() {
        let mut root = json!({"a": {"b": {"c": 5}}});
        set(&mut root, &Path::parse("a.b.c"), json!(7)).unwrap();
        assert_eq!(get(&root, &Path::parse("a.b.c")).unwrap(), Some(json!(7)));
    }

    #[test]
    fn test_set_creates_intermediate_containers() {
        let mut root = json!({});
        set(&mut root, &Path::parse("x.y.z"), json!(true)).unwrap();
        assert_eq!(root, json!({"x": {"y": {"z": true}}}));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut root = json!({"a": 5});
        let err = set(&mut root, &Path::parse("a.b"), json!(1)).unwrap_err();
        assert!(matches!(err, Error::NotAContainer { ref segment, .. } if segment == "a"));
    }

    #[test]
    fn test_set_array_append() {
        let mut root = json!({"list": [1]});
        set(&mut root, &Path::parse("list.1"), json!(2)).unwrap();
        assert_eq!(root, json!({"list": [1, 2]}));
        assert!(set(&mut root, &Path::parse("list.9"), json!(3)).is_err());
    }

    #[test]
    fn test_check_set_matches_set_without_writing() {
        let root = json!({"a": {"b": 1}, "list": [1], "n": 5});
        let before = root.clone();

        assert!(check_set(&root, &Path::parse("a.c"), &json!(2)).is_ok());
        assert!(check_set(&root, &Path::parse("list.1"), &json!(2)).is_ok());
        assert!(matches!(
            check_set(&root, &Path::parse("list.9"), &json!(2)),
            Err(Error::NotAContainer { .. })
        ));
        assert!(matches!(
            check_set(&root, &Path::parse("n.x"), &json!(2)),
            Err(Error::NotAContainer { .. })
        ));
        assert!(matches!(
            check_set(&root, &Path::parse("x.y"), &json!(2)),
            Err(Error::Unresolved { .. })
        ));
        assert_eq!(root, before);
    }

    struct Functions {
        double: fn(f64) -> f64,
    }

    impl Addressable for Functions {
        type Cursor = Vec<String>;
        type Value = ();

        fn root(&self) -> Vec<String> {
            vec![]
        }

        fn descend(&self, at: &Vec<String>, segment: &Segment) -> Option<Vec<String>> {
            let key = segment.key();
            let ok = match at.len() {
                0 => key == "math",
                1 => key == "double" || key == "pi",
                _ => false,
            };
            ok.then(|| {
                let mut next = at.clone();
                next.push(key);
                next
            })
        }

        fn read(&self, _at: &Vec<String>) -> Option<()> {
            Some(())
        }
    }

    impl Callable for Functions {
        type Args = f64;
        type Output = f64;

        fn call(&self, at: &Vec<String>, args: &f64) -> Option<f64> {
            (at.last().map(String::as_str) == Some("double")).then(|| (self.double)(*args))
        }
    }

    #[test]
    fn test_invoke() {
        let functions = Functions { double: |x| x * 2.0 };
        assert_eq!(invoke(&functions, &Path::parse("math.double"), &4.0).unwrap(), 8.0);
        assert!(matches!(
            invoke(&functions, &Path::parse("math.pi"), &1.0),
            Err(Error::NotCallable { .. })
        ));
        assert!(matches!(
            invoke(&functions, &Path::parse("nope.double"), &1.0),
            Err(Error::Unresolved { .. })
        ));
    }
}
