//! Prepared workflow definitions
//!
//! Preparing a definition flattens the authoring tree into an arena of
//! [`ActivityNode`]s addressed by [`ActivityId`], assigns each node a dotted
//! path, collects validation findings and computes a structural fingerprint.
//! The result is immutable and shared (`Arc`) by every executor running it.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::activity::{Activity, ActivityKind, Argument, ArgumentBinding, Variable};
use super::error::{EngineError, EngineResult};
use super::validation::{ValidationError, ValidationErrors};

/// Index of a node in a prepared definition (pre-order)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ActivityId(pub u32);

impl ActivityId {
    /// The root activity of every definition
    pub const ROOT: ActivityId = ActivityId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Structural identity of a definition (blake3, hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionFingerprint(pub String);

impl fmt::Display for DefinitionFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata sink handed to activity bodies while a definition is prepared
pub struct ActivityMetadata<'a> {
    path: &'a str,
    display_name: &'a str,
    child_count: usize,
    findings: &'a mut ValidationErrors,
    bookmarks: &'a mut Vec<String>,
}

impl ActivityMetadata<'_> {
    /// Dotted path of the activity
    pub fn path(&self) -> &str {
        self.path
    }

    /// Display name of the activity
    pub fn display_name(&self) -> &str {
        self.display_name
    }

    /// Number of declared children
    pub fn child_count(&self) -> usize {
        self.child_count
    }

    /// Record an error; the activity will refuse to run
    pub fn add_validation_error(&mut self, message: impl Into<String>) {
        self.findings
            .push(ValidationError::error(self.path, self.display_name, message));
    }

    /// Record a warning
    pub fn add_validation_warning(&mut self, message: impl Into<String>) {
        self.findings
            .push(ValidationError::warning(self.path, self.display_name, message));
    }

    /// Declare a bookmark name this activity creates in the default scope
    ///
    /// Two activities declaring the same name is a validation error.
    pub fn declare_bookmark(&mut self, name: impl Into<String>) {
        self.bookmarks.push(name.into());
    }
}

/// A prepared activity node
#[derive(Debug)]
pub struct ActivityNode {
    /// Arena index
    pub id: ActivityId,
    /// Parent node
    pub parent: Option<ActivityId>,
    /// Declared children, in declaration order
    pub children: Vec<ActivityId>,
    /// Dotted path, e.g. `1.2.1`
    pub path: String,
    /// Display name
    pub display_name: String,
    /// Body
    pub kind: ActivityKind,
    /// Declared variables
    pub variables: Vec<Variable>,
    /// Declared arguments
    pub arguments: Vec<Argument>,
    /// Findings attributed to this node
    pub findings: ValidationErrors,
}

impl ActivityNode {
    /// Look up a declared argument
    pub fn argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|a| a.name == name)
    }

    /// True when no error-level finding is attributed to this node
    pub fn is_valid(&self) -> bool {
        !self.findings.has_errors()
    }
}

/// An immutable, validated activity tree
#[derive(Debug)]
pub struct WorkflowDefinition {
    nodes: Vec<ActivityNode>,
    by_path: HashMap<String, ActivityId>,
    fingerprint: DefinitionFingerprint,
    validation: ValidationErrors,
}

impl WorkflowDefinition {
    /// Prepare an authoring tree
    ///
    /// Always succeeds; findings are available through [`validation`](Self::validation)
    /// and block execution when they contain errors.
    pub fn prepare(root: Activity) -> Arc<Self> {
        let mut builder = Builder::default();
        builder.add(root, None, "1".to_string(), &[]);
        builder.check_declared_bookmarks();

        let fingerprint = compute_fingerprint(&builder.nodes);
        let mut validation = ValidationErrors::new();
        for node in &builder.nodes {
            validation.extend(node.findings.clone());
        }

        let by_path = builder
            .nodes
            .iter()
            .map(|n| (n.path.clone(), n.id))
            .collect();

        Arc::new(Self {
            nodes: builder.nodes,
            by_path,
            fingerprint,
            validation,
        })
    }

    /// The root node
    pub fn root(&self) -> &ActivityNode {
        &self.nodes[0]
    }

    /// A node by id
    ///
    /// Ids only come from this definition, so lookups are infallible.
    pub fn node(&self, id: ActivityId) -> &ActivityNode {
        &self.nodes[id.index()]
    }

    /// A node by id, if it exists
    pub fn get(&self, id: ActivityId) -> Option<&ActivityNode> {
        self.nodes.get(id.index())
    }

    /// A node by dotted path
    pub fn find_by_path(&self, path: &str) -> Option<ActivityId> {
        self.by_path.get(path).copied()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True for an empty arena (never happens for prepared definitions)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in pre-order
    pub fn nodes(&self) -> impl Iterator<Item = &ActivityNode> {
        self.nodes.iter()
    }

    /// Structural fingerprint
    pub fn fingerprint(&self) -> &DefinitionFingerprint {
        &self.fingerprint
    }

    /// All findings
    pub fn validation(&self) -> &ValidationErrors {
        &self.validation
    }

    /// Fail with the collected findings when any is an error
    pub fn ensure_valid(&self) -> EngineResult<()> {
        if self.validation.has_errors() {
            return Err(EngineError::Validation(self.validation.clone()));
        }
        Ok(())
    }

    /// Check required root inputs against the values a host supplies
    pub fn check_inputs(&self, inputs: &BTreeMap<String, super::value::Value>) -> EngineResult<()> {
        let root = self.root();
        let mut findings = ValidationErrors::new();
        for argument in &root.arguments {
            let bound = !matches!(argument.binding, ArgumentBinding::Unbound);
            if argument.required
                && argument.direction.is_input()
                && !bound
                && !inputs.contains_key(&argument.name)
            {
                findings.push(ValidationError::error(
                    &root.path,
                    &root.display_name,
                    format!("required input '{}' was not supplied", argument.name),
                ));
            }
        }
        for name in inputs.keys() {
            if root.argument(name).is_none() {
                findings.push(ValidationError::error(
                    &root.path,
                    &root.display_name,
                    format!("input '{}' does not match a root argument", name),
                ));
            }
        }
        if findings.has_errors() {
            return Err(EngineError::Validation(findings));
        }
        Ok(())
    }

    /// True when `child` is a declared child of `parent`
    pub fn is_declared_child(&self, parent: ActivityId, child: ActivityId) -> bool {
        self.get(child).and_then(|c| c.parent) == Some(parent)
    }
}

#[derive(Default)]
struct Builder {
    nodes: Vec<ActivityNode>,
    declared_bookmarks: Vec<(ActivityId, String)>,
}

impl Builder {
    /// Add a node and its subtree in pre-order
    ///
    /// `visible` holds the locations declared by ancestors.
    fn add(
        &mut self,
        activity: Activity,
        parent: Option<ActivityId>,
        path: String,
        visible: &[String],
    ) -> ActivityId {
        let id = ActivityId(self.nodes.len() as u32);
        let Activity {
            display_name,
            kind,
            children,
            variables,
            arguments,
        } = activity;

        let mut findings = ValidationErrors::new();
        let mut bookmarks = Vec::new();
        {
            let mut metadata = ActivityMetadata {
                path: &path,
                display_name: &display_name,
                child_count: children.len(),
                findings: &mut findings,
                bookmarks: &mut bookmarks,
            };
            kind.cache_metadata(&mut metadata);
        }

        check_locations(&path, &display_name, &variables, &arguments, &mut findings);
        if parent.is_some() {
            check_bindings(&path, &display_name, &arguments, visible, &mut findings);
        }

        for name in bookmarks {
            self.declared_bookmarks.push((id, name));
        }

        self.nodes.push(ActivityNode {
            id,
            parent,
            children: Vec::new(),
            path: path.clone(),
            display_name,
            kind,
            variables,
            arguments,
            findings,
        });

        let mut child_visible = visible.to_vec();
        {
            let node = &self.nodes[id.index()];
            child_visible.extend(node.variables.iter().map(|v| v.name.clone()));
            child_visible.extend(node.arguments.iter().map(|a| a.name.clone()));
        }

        let mut child_ids = Vec::with_capacity(children.len());
        for (index, child) in children.into_iter().enumerate() {
            let child_path = format!("{}.{}", path, index + 1);
            child_ids.push(self.add(child, Some(id), child_path, &child_visible));
        }
        self.nodes[id.index()].children = child_ids;

        id
    }

    fn check_declared_bookmarks(&mut self) {
        let mut seen: HashMap<&str, ActivityId> = HashMap::new();
        let mut duplicates = Vec::new();
        for (id, name) in &self.declared_bookmarks {
            if let Some(first) = seen.get(name.as_str()) {
                duplicates.push((*id, *first, name.clone()));
            } else {
                seen.insert(name.as_str(), *id);
            }
        }
        for (id, first, name) in duplicates {
            let first_path = self.nodes[first.index()].path.clone();
            let node = &mut self.nodes[id.index()];
            let finding = ValidationError::error(
                &node.path,
                &node.display_name,
                format!(
                    "bookmark '{}' is already declared by activity {}",
                    name, first_path
                ),
            );
            node.findings.push(finding);
        }
    }
}

fn check_locations(
    path: &str,
    display_name: &str,
    variables: &[Variable],
    arguments: &[Argument],
    findings: &mut ValidationErrors,
) {
    let mut names = HashSet::new();
    for variable in variables {
        if !names.insert(variable.name.as_str()) {
            findings.push(ValidationError::error(
                path,
                display_name,
                format!("variable '{}' is declared more than once", variable.name),
            ));
        }
    }
    for argument in arguments {
        if !names.insert(argument.name.as_str()) {
            findings.push(ValidationError::error(
                path,
                display_name,
                format!(
                    "argument '{}' collides with another variable or argument",
                    argument.name
                ),
            ));
        }
    }
}

fn check_bindings(
    path: &str,
    display_name: &str,
    arguments: &[Argument],
    visible: &[String],
    findings: &mut ValidationErrors,
) {
    for argument in arguments {
        match &argument.binding {
            ArgumentBinding::Unbound => {
                if argument.required && argument.direction.is_input() {
                    findings.push(ValidationError::error(
                        path,
                        display_name,
                        format!("required argument '{}' has no binding", argument.name),
                    ));
                }
            }
            ArgumentBinding::Literal(_) => {
                if argument.direction.is_output() {
                    findings.push(ValidationError::error(
                        path,
                        display_name,
                        format!(
                            "argument '{}' flows out and cannot bind to a literal",
                            argument.name
                        ),
                    ));
                }
            }
            ArgumentBinding::Variable(name) => {
                if !visible.iter().any(|v| v == name) {
                    findings.push(ValidationError::error(
                        path,
                        display_name,
                        format!(
                            "argument '{}' binds to '{}', which is not visible here",
                            argument.name, name
                        ),
                    ));
                }
            }
        }
    }
}

fn compute_fingerprint(nodes: &[ActivityNode]) -> DefinitionFingerprint {
    let mut hasher = Hasher::new();
    for node in nodes {
        hasher.update(node.path.as_bytes());
        hasher.update(b"\0");
        hasher.update(node.display_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(node.kind.tag().as_bytes());
        hasher.update(node.kind.type_name().as_bytes());
        for variable in &node.variables {
            hasher.update(b"v:");
            hasher.update(variable.name.as_bytes());
        }
        for argument in &node.arguments {
            hasher.update(b"a:");
            hasher.update(argument.name.as_bytes());
            hasher.update(format!("{:?}", argument.direction).as_bytes());
        }
        hasher.update(&(node.children.len() as u64).to_le_bytes());
    }
    DefinitionFingerprint(hasher.finalize().to_hex().to_string())
}
