//! Registration call injection into target classes.
//!
//! Rules are grouped by target class. Each group materializes its target once,
//! applies its rules in configured order and writes the result to the scratch
//! directory. A rule that fails leaves the class as the previous rules left it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use opentelemetry::{Context as OtelContext, KeyValue};
use rayon::prelude::*;
use serde::Serialize;

use crate::bytecode::{Code, Insertion, insert_code, instruction_offsets, is_return};
use crate::classfile::{
    ACC_STATIC, Attribute, CONSTRUCTOR, ClassFile, Member, STATIC_INITIALIZER,
};
use crate::descriptor::register_signature;
use crate::error::AutoRegisterError;
use crate::inputs::Inputs;
use crate::locate::{materialize_target, write_scratch};
use crate::opcodes;
use crate::rule::Rule;
use crate::scan::ScanResult;
use crate::telemetry::{Telemetry, add_current_span_event, with_child_span};

/// Where the registration sequence goes in one target method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InjectionMode {
    /// Before the first instruction.
    Entry,
    /// Before every return instruction.
    Exit,
    /// New static initializer holding only the sequence.
    Synthesize,
}

/// Pick the injection mode for a target method.
///
/// `None` means the method is missing and cannot be synthesized.
pub(crate) fn select_injection_mode(
    exists: bool,
    is_static: bool,
    is_static_initializer: bool,
) -> Option<InjectionMode> {
    match (exists, is_static, is_static_initializer) {
        (true, _, true) => Some(InjectionMode::Exit),
        (true, true, false) => Some(InjectionMode::Entry),
        (true, false, false) => Some(InjectionMode::Exit),
        (false, _, true) => Some(InjectionMode::Synthesize),
        (false, _, false) => None,
    }
}

/// Result of injecting one rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub(crate) enum InjectionOutcome {
    #[serde(rename_all = "camelCase")]
    Injected {
        entry_name: String,
        scratch_path: PathBuf,
        registered: usize,
        methods: usize,
    },
    #[serde(rename_all = "camelCase")]
    Skipped { kind: &'static str, reason: String },
    NoMatches,
}

impl InjectionOutcome {
    fn skipped(error: &AutoRegisterError) -> Self {
        InjectionOutcome::Skipped {
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

/// Outcomes parallel to the configured rules.
#[derive(Clone, Debug)]
pub(crate) struct InjectionOutput {
    pub(crate) outcomes: Vec<InjectionOutcome>,
}

impl InjectionOutput {
    /// Entry name -> scratch file for every rewritten target class.
    pub(crate) fn substitutions(&self) -> BTreeMap<String, PathBuf> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                InjectionOutcome::Injected {
                    entry_name,
                    scratch_path,
                    ..
                } => Some((entry_name.clone(), scratch_path.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn injected_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, InjectionOutcome::Injected { .. }))
            .count()
    }
}

/// What one rule changed in its target class.
struct RuleInjection {
    registered: usize,
    methods: usize,
}

/// Inject every rule with matches. Target classes are processed in parallel.
pub(crate) fn inject_all(
    inputs: &Inputs,
    rules: &[Rule],
    scan: &ScanResult,
    work_dir: &Path,
    telemetry: Option<&Telemetry>,
) -> InjectionOutput {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, matched) in scan.iter() {
        if matched.is_empty() {
            continue;
        }
        groups
            .entry(rules[index].target_class.as_str())
            .or_default()
            .push(index);
    }
    let groups: Vec<(&str, Vec<usize>)> = groups.into_iter().collect();

    let parent = OtelContext::current();
    let results: Vec<Vec<(usize, InjectionOutcome)>> = groups
        .par_iter()
        .map(|(target, indices)| {
            let attributes = [
                KeyValue::new("autoreg.target", target.to_string()),
                KeyValue::new("autoreg.rule_count", indices.len() as i64),
            ];
            with_child_span(telemetry, "inject.target", &attributes, &parent, || {
                inject_group(inputs, target, indices, rules, scan, work_dir)
            })
        })
        .collect();

    let mut outcomes = vec![InjectionOutcome::NoMatches; rules.len()];
    for (index, outcome) in results.into_iter().flatten() {
        outcomes[index] = outcome;
    }
    InjectionOutput { outcomes }
}

fn inject_group(
    inputs: &Inputs,
    target: &str,
    indices: &[usize],
    rules: &[Rule],
    scan: &ScanResult,
    work_dir: &Path,
) -> Vec<(usize, InjectionOutcome)> {
    let skip_all = |error: AutoRegisterError| {
        tracing::warn!(target_class = target, "skipping injection: {error}");
        add_current_span_event(
            "inject.skipped",
            &[KeyValue::new("autoreg.error", error.kind())],
        );
        indices
            .iter()
            .map(|index| (*index, InjectionOutcome::skipped(&error)))
            .collect::<Vec<_>>()
    };

    let materialized = match materialize_target(inputs, target, work_dir) {
        Ok(materialized) => materialized,
        Err(error) => return skip_all(error),
    };
    let mut class = match ClassFile::parse(&materialized.bytes) {
        Ok(class) => class,
        Err(err) => {
            return skip_all(AutoRegisterError::MalformedClass {
                origin: format!("{} in {}", materialized.entry_name, materialized.location),
                reason: format!("{err:#}"),
            });
        }
    };

    match class.name() {
        Ok(name) if name == target => {}
        Ok(name) => {
            return skip_all(AutoRegisterError::MalformedClass {
                origin: format!("{} in {}", materialized.entry_name, materialized.location),
                reason: format!("declares class {name}"),
            });
        }
        Err(err) => {
            return skip_all(AutoRegisterError::MalformedClass {
                origin: format!("{} in {}", materialized.entry_name, materialized.location),
                reason: format!("{err:#}"),
            });
        }
    }

    let mut outcomes = Vec::with_capacity(indices.len());
    let mut applied = Vec::new();
    let mut entry_prefixes = EntryPrefixes::new();
    for &index in indices {
        let rule = &rules[index];
        let mut candidate = class.clone();
        let mut candidate_prefixes = entry_prefixes.clone();
        match inject_rule(
            &mut candidate,
            &mut candidate_prefixes,
            rule,
            scan.matches(index),
        ) {
            Ok(injection) => {
                tracing::info!(
                    rule = %rule.label(),
                    registered = injection.registered,
                    methods = injection.methods,
                    "injected registrations"
                );
                class = candidate;
                entry_prefixes = candidate_prefixes;
                applied.push((index, injection));
            }
            Err(error) => {
                tracing::warn!(rule = %rule.label(), "skipping rule: {error}");
                outcomes.push((index, InjectionOutcome::skipped(&error)));
            }
        }
    }
    if applied.is_empty() {
        return outcomes;
    }

    let written = class
        .to_bytes()
        .and_then(|bytes| {
            verify_class(&bytes)?;
            Ok(bytes)
        })
        .map_err(|err| AutoRegisterError::rewrite(target, err))
        .and_then(|bytes| {
            write_scratch(&materialized.scratch_path, &bytes).map_err(|reason| {
                AutoRegisterError::Rewrite {
                    class: target.to_string(),
                    reason,
                }
            })
        });
    if let Err(error) = written {
        tracing::warn!(target_class = target, "discarding rewritten class: {error}");
        outcomes.extend(
            applied
                .into_iter()
                .map(|(index, _)| (index, InjectionOutcome::skipped(&error))),
        );
        return outcomes;
    }

    outcomes.extend(applied.into_iter().map(|(index, injection)| {
        (
            index,
            InjectionOutcome::Injected {
                entry_name: materialized.entry_name.clone(),
                scratch_path: materialized.scratch_path.clone(),
                registered: injection.registered,
                methods: injection.methods,
            },
        )
    }));
    outcomes
}

/// Re-read rewritten bytes with an independent parser.
fn verify_class(bytes: &[u8]) -> Result<()> {
    match jclassfile::class_file::parse(bytes) {
        Ok(_) => Ok(()),
        Err(err) => {
            let message = format!("{err}");
            if message.contains("unmatched attribute") {
                tracing::debug!("skipping structural check: {message}");
                return Ok(());
            }
            Err(err).context("rewritten class does not parse")
        }
    }
}

/// Method index -> length of the registration code already placed at its entry.
///
/// Later rules append after it so entry registrations keep configured order.
type EntryPrefixes = BTreeMap<usize, usize>;

/// Register method chosen for one matched class.
#[derive(Clone, Debug, PartialEq, Eq)]
struct RegisterCall {
    class_name: String,
    descriptor: String,
    is_static: bool,
    return_slots: u8,
}

#[derive(Clone, Debug)]
struct RegisterCandidate {
    descriptor: String,
    parameter: String,
    is_static: bool,
    return_slots: u8,
}

fn inject_rule(
    class: &mut ClassFile,
    entry_prefixes: &mut EntryPrefixes,
    rule: &Rule,
    matched: &BTreeSet<String>,
) -> Result<RuleInjection, AutoRegisterError> {
    let target = rule.target_class.as_str();
    let is_static_initializer = rule.target_method == STATIC_INITIALIZER;
    let candidates = register_candidates(class, &rule.register_method)
        .map_err(|err| AutoRegisterError::rewrite(target, err))?;
    let calls = matched
        .iter()
        .map(|class_name| choose_register_method(&candidates, rule, class_name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut method_indices = Vec::new();
    for (index, method) in class.methods.iter().enumerate() {
        let name = class
            .method_name(method)
            .map_err(|err| AutoRegisterError::rewrite(target, err))?;
        if name == rule.target_method {
            method_indices.push(index);
        }
    }

    if method_indices.is_empty() {
        return match select_injection_mode(false, true, is_static_initializer) {
            Some(InjectionMode::Synthesize) => {
                check_staticness(rule, &calls, true)?;
                synthesize_static_initializer(class, rule, &calls)
                    .map_err(|err| AutoRegisterError::rewrite(target, err))?;
                Ok(RuleInjection {
                    registered: calls.len(),
                    methods: 1,
                })
            }
            _ => Err(AutoRegisterError::TargetMethodNotFound {
                class: target.to_string(),
                method: rule.target_method.clone(),
            }),
        };
    }

    for &index in &method_indices {
        let is_static = class.methods[index].is_static();
        let Some(mode) = select_injection_mode(true, is_static, is_static_initializer) else {
            continue;
        };
        check_staticness(rule, &calls, is_static)?;
        inject_method(class, entry_prefixes, index, mode, is_static, rule, &calls)
            .map_err(|err| AutoRegisterError::rewrite(target, err))?;
    }
    Ok(RuleInjection {
        registered: calls.len(),
        methods: method_indices.len(),
    })
}

/// Declared methods named `name` that take exactly one class-typed parameter.
fn register_candidates(class: &ClassFile, name: &str) -> Result<Vec<RegisterCandidate>> {
    let mut candidates = Vec::new();
    for method in &class.methods {
        if class.method_name(method)? != name {
            continue;
        }
        let descriptor = class.method_descriptor(method)?;
        let Some(signature) = register_signature(descriptor)
            .with_context(|| format!("register method {name}{descriptor}"))?
        else {
            continue;
        };
        candidates.push(RegisterCandidate {
            descriptor: descriptor.to_string(),
            parameter: signature.parameter,
            is_static: method.is_static(),
            return_slots: signature.return_slots,
        });
    }
    Ok(candidates)
}

/// Prefer the overload taking the matched class, then the scanned interface,
/// then a scanned superclass, then the only overload.
fn choose_register_method(
    candidates: &[RegisterCandidate],
    rule: &Rule,
    class_name: &str,
) -> Result<RegisterCall, AutoRegisterError> {
    let error = |reason: String| AutoRegisterError::RegisterMethod {
        class: rule.target_class.clone(),
        method: rule.register_method.clone(),
        reason,
    };
    let tiers: [&dyn Fn(&str) -> bool; 3] = [
        &|parameter| parameter == class_name,
        &|parameter| rule.scan_interface.as_deref() == Some(parameter),
        &|parameter| rule.scan_super_classes.contains(parameter),
    ];

    let mut chosen = None;
    for accepts in tiers {
        let found: Vec<&RegisterCandidate> = candidates
            .iter()
            .filter(|candidate| accepts(candidate.parameter.as_str()))
            .collect();
        match found.as_slice() {
            [] => continue,
            [candidate] => {
                chosen = Some(*candidate);
                break;
            }
            _ => {
                return Err(error(format!(
                    "{} overloads accept {class_name}",
                    found.len()
                )));
            }
        }
    }
    let chosen = match (chosen, candidates) {
        (Some(candidate), _) => candidate,
        (None, [only]) => only,
        (None, []) => {
            return Err(error(
                "no declared method takes exactly one object parameter".to_string(),
            ));
        }
        (None, _) => {
            return Err(error(format!(
                "{} overloads and none takes {class_name}",
                candidates.len()
            )));
        }
    };
    Ok(RegisterCall {
        class_name: class_name.to_string(),
        descriptor: chosen.descriptor.clone(),
        is_static: chosen.is_static,
        return_slots: chosen.return_slots,
    })
}

fn check_staticness(
    rule: &Rule,
    calls: &[RegisterCall],
    context_is_static: bool,
) -> Result<(), AutoRegisterError> {
    let Some(call) = calls.iter().find(|call| call.is_static != context_is_static) else {
        return Ok(());
    };
    let (method_kind, context_kind) = if call.is_static {
        ("static", "an instance method")
    } else {
        ("an instance method", "static")
    };
    Err(AutoRegisterError::RegisterMethod {
        class: rule.target_class.clone(),
        method: rule.register_method.clone(),
        reason: format!(
            "{}{} is {method_kind} but {} is {context_kind}",
            rule.register_method, call.descriptor, rule.target_method
        ),
    })
}

/// Emit `new C; dup; invokespecial C.<init>()V; invoke register` per call.
///
/// Returns the bytes and the operand stack depth they need.
fn registration_sequence(
    class: &mut ClassFile,
    target: &str,
    register_method: &str,
    calls: &[RegisterCall],
    is_static: bool,
) -> Result<(Vec<u8>, u16)> {
    let interface = class.is_interface();
    let pool = &mut class.constant_pool;
    let mut bytes = Vec::new();
    for call in calls {
        let class_index = pool.class_index(&call.class_name)?;
        let constructor = pool.method_ref_index(&call.class_name, CONSTRUCTOR, "()V", false)?;
        let register = pool.method_ref_index(target, register_method, &call.descriptor, interface)?;

        if !is_static {
            bytes.push(opcodes::ALOAD_0);
        }
        bytes.push(opcodes::NEW);
        bytes.extend_from_slice(&class_index.to_be_bytes());
        bytes.push(opcodes::DUP);
        bytes.push(opcodes::INVOKESPECIAL);
        bytes.extend_from_slice(&constructor.to_be_bytes());
        if is_static {
            bytes.push(opcodes::INVOKESTATIC);
            bytes.extend_from_slice(&register.to_be_bytes());
        } else if interface {
            bytes.push(opcodes::INVOKEINTERFACE);
            bytes.extend_from_slice(&register.to_be_bytes());
            bytes.extend_from_slice(&[2, 0]);
        } else {
            bytes.push(opcodes::INVOKEVIRTUAL);
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        match call.return_slots {
            0 => {}
            1 => bytes.push(opcodes::POP),
            _ => bytes.push(opcodes::POP2),
        }
    }
    let need = if is_static { 2 } else { 3 };
    Ok((bytes, need))
}

fn inject_method(
    class: &mut ClassFile,
    entry_prefixes: &mut EntryPrefixes,
    method_index: usize,
    mode: InjectionMode,
    is_static: bool,
    rule: &Rule,
    calls: &[RegisterCall],
) -> Result<()> {
    let (sequence, need) = registration_sequence(
        class,
        &rule.target_class,
        &rule.register_method,
        calls,
        is_static,
    )?;
    let method = &class.methods[method_index];
    let position = method
        .attribute_position(&class.constant_pool, "Code")
        .with_context(|| format!("method {} has no Code attribute", rule.target_method))?;
    let code = Code::parse(&method.attributes[position].info).context("parse Code attribute")?;

    let (insertions, max_stack) = match mode {
        InjectionMode::Entry => {
            let prefix = entry_prefixes.entry(method_index).or_insert(0);
            let offset = *prefix;
            *prefix += sequence.len();
            (
                vec![Insertion {
                    offset,
                    bytes: sequence,
                    captures_targets: false,
                }],
                code.max_stack.max(need),
            )
        }
        InjectionMode::Exit => {
            let returns: Vec<Insertion> = instruction_offsets(&code.code)?
                .into_iter()
                .filter(|offset| is_return(code.code[*offset]))
                .map(|offset| Insertion {
                    offset,
                    bytes: sequence.clone(),
                    captures_targets: true,
                })
                .collect();
            if returns.is_empty() {
                tracing::debug!(method = %rule.target_method, "method never returns normally");
            }
            let max_stack = code
                .max_stack
                .checked_add(need)
                .context("max_stack exceeds 65535")?;
            (returns, max_stack)
        }
        InjectionMode::Synthesize => anyhow::bail!("cannot rewrite a synthesized method"),
    };

    let mut rewritten = insert_code(&code, &insertions, &class.constant_pool)
        .with_context(|| format!("relocate code of {}", rule.target_method))?;
    rewritten.max_stack = max_stack;
    class.methods[method_index].attributes[position].info = rewritten.to_bytes()?;
    Ok(())
}

fn synthesize_static_initializer(
    class: &mut ClassFile,
    rule: &Rule,
    calls: &[RegisterCall],
) -> Result<()> {
    let (mut sequence, need) = registration_sequence(
        class,
        &rule.target_class,
        &rule.register_method,
        calls,
        true,
    )?;
    sequence.push(opcodes::RETURN);
    let code = Code {
        max_stack: need,
        max_locals: 0,
        code: sequence,
        exception_table: Vec::new(),
        attributes: Vec::new(),
    };
    let pool = &mut class.constant_pool;
    let method = Member {
        access_flags: ACC_STATIC,
        name_index: pool.utf8_index(STATIC_INITIALIZER)?,
        descriptor_index: pool.utf8_index("()V")?,
        attributes: vec![Attribute {
            name_index: pool.utf8_index("Code")?,
            info: code.to_bytes()?,
        }],
    };
    class.methods.push(method);
    Ok(())
}
