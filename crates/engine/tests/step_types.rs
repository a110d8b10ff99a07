mod common;

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{FixedDice, FlakyDice, RecordingNames, catalog, flow_yaml, init_tracing, inputs, table_yaml};
use grimoire_engine::{EngineConfig, ErrorKind, FlowCallbacks, FlowEngine, MockLlmClient, RetryingScheduler};
use grimoire_types::{PromptDefinition, SystemCatalog};
use serde_json::{Map, Value, json};

fn weapons_catalog() -> SystemCatalog {
    catalog(vec![flow_yaml(
        r#"
id: armory
outputs:
  - id: picks
    type: list
  - id: first
    type: str
steps:
  - id: pick
    type: player_choice
    prompt: "Choose two weapons"
    choice_source:
      table: weapons
      selection_count: 2
    actions:
      - set_value: {path: outputs.picks, value: "{{ steps.pick.results }}"}
      - set_value: {path: outputs.first, value: "{{ steps.pick.result }}"}
"#,
    )])
    .with_table(table_yaml(
        r#"
id: weapons
roll: 1d6
entries:
  - {range: "1-2", value: sword}
  - {range: "3-4", value: axe}
  - {range: "5-6", value: bow}
"#,
    ))
}

#[test]
fn multi_selection_with_the_wrong_size_is_rejected() {
    let engine = FlowEngine::new(weapons_catalog());
    let callbacks = FlowCallbacks::new().on_user_input(|_, _| Ok(json!(["sword"])));

    let error = engine.execute("armory", Map::new(), &callbacks).unwrap_err();
    assert_eq!(error.kind, ErrorKind::UserInput);
    assert_eq!(error.step_id.as_deref(), Some("pick"));
}

#[test]
fn multi_selection_populates_results_and_the_first_result() {
    let presented = RefCell::new(None);
    let engine = FlowEngine::new(weapons_catalog());
    let callbacks = FlowCallbacks::new().on_user_input(|step, _| {
        *presented.borrow_mut() = Some(step.step_config["choices"].clone());
        Ok(json!(["axe", "bow"]))
    });

    let outputs = engine.execute("armory", Map::new(), &callbacks).expect("run");
    drop(callbacks);

    assert_eq!(outputs["picks"], json!(["axe", "bow"]));
    assert_eq!(outputs["first"], json!("axe"));
    assert_eq!(
        presented.into_inner(),
        Some(json!([
            {"id": "sword", "label": "Sword"},
            {"id": "axe", "label": "Axe"},
            {"id": "bow", "label": "Bow"}
        ]))
    );
}

#[test]
fn static_choices_run_their_actions_and_jump() {
    let engine = FlowEngine::new(catalog(vec![flow_yaml(
        r#"
id: crossroads
inputs:
  - id: name
    type: str
outputs:
  - id: path
    type: str
  - id: visited_cave
    type: bool
steps:
  - id: choose
    type: player_choice
    prompt: "Which way, {{ inputs.name }}?"
    choices:
      - id: forest
        label: Into the forest
        actions:
          - set_value: {path: outputs.path, value: forest}
        next_step: finish
      - id: cave
        label: Down the cave
        actions:
          - set_value: {path: outputs.path, value: cave}
  - id: cave_entrance
    type: completion
    actions:
      - set_value: {path: outputs.visited_cave, value: true}
  - id: finish
    type: completion
"#,
    )]));

    let prompts = RefCell::new(Vec::new());
    let callbacks = FlowCallbacks::new().on_user_input(|step, _| {
        prompts.borrow_mut().push(step.prompt.clone());
        Ok(json!("Into the forest"))
    });
    let outputs = engine
        .execute("crossroads", inputs(json!({"name": "Ayla"})), &callbacks)
        .expect("run");
    drop(callbacks);

    assert_eq!(outputs["path"], json!("forest"));
    assert_eq!(outputs["visited_cave"], Value::Null);
    assert_eq!(prompts.into_inner(), vec![Some("Which way, Ayla?".to_string())]);
}

#[test]
fn player_input_requires_a_callback() {
    let engine = FlowEngine::new(catalog(vec![flow_yaml(
        r#"
id: ask
outputs:
  - id: name
    type: str
steps:
  - id: ask_name
    type: player_input
    prompt: "Name your hero"
    actions:
      - set_value: {path: outputs.name, value: "{{ result }}"}
"#,
    )]));

    let error = engine.execute("ask", Map::new(), &FlowCallbacks::new()).unwrap_err();
    assert_eq!(error.kind, ErrorKind::UserInput);

    let callbacks = FlowCallbacks::new().on_user_input(|_, _| Ok(json!("Morrigan")));
    let outputs = engine.execute("ask", Map::new(), &callbacks).expect("run");
    assert_eq!(outputs["name"], json!("Morrigan"));
}

#[test]
fn flow_call_isolates_sub_flow_variables() {
    init_tracing();
    let child = flow_yaml(
        r#"
id: forge
inputs:
  - id: metal
    type: str
    required: true
outputs:
  - id: blade
    type: str
variables:
  - id: secret
    type: str
steps:
  - id: work
    type: completion
    actions:
      - set_value: {path: variables.secret, value: "child"}
      - set_value: {path: outputs.blade, value: "{{ inputs.metal }} blade"}
"#,
    );
    let parent = flow_yaml(
        r#"
id: smithy
variables:
  - id: secret
    type: str
  - id: weapon
    type: str
outputs:
  - id: secret
    type: str
  - id: weapon
    type: str
steps:
  - id: prepare
    type: completion
    actions:
      - set_value: {path: variables.secret, value: "parent"}
  - id: call_forge
    type: flow_call
    flow_id: forge
    inputs:
      metal: "{{ 'mithril' }}"
    outputs:
      blade: variables.weapon
  - id: report
    type: completion
    actions:
      - set_value: {path: outputs.secret, value: "{{ variables.secret }}"}
      - set_value: {path: outputs.weapon, value: "{{ variables.weapon }}"}
"#,
    );

    let completed = RefCell::new(Vec::new());
    let engine = FlowEngine::new(catalog(vec![child, parent]));
    let callbacks = FlowCallbacks::new().on_step_complete(|step_id, _| completed.borrow_mut().push(step_id.to_string()));
    let outputs = engine.execute("smithy", Map::new(), &callbacks).expect("run");
    drop(callbacks);

    assert_eq!(outputs["secret"], json!("parent"));
    assert_eq!(outputs["weapon"], json!("mithril blade"));
    assert_eq!(completed.into_inner(), ["prepare", "call_forge", "report"]);
}

#[test]
fn sub_flow_failures_are_reported_against_the_calling_step() {
    let engine = FlowEngine::new(catalog(vec![
        flow_yaml(
            r#"
id: strict_child
inputs:
  - id: level
    type: int
    required: true
steps:
  - id: done
    type: completion
"#,
        ),
        flow_yaml(
            r#"
id: careless_parent
steps:
  - id: call
    type: flow_call
    flow_id: strict_child
"#,
        ),
    ]));

    let error = engine.execute("careless_parent", Map::new(), &FlowCallbacks::new()).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(error.step_id.as_deref(), Some("call"));
    assert!(error.message.contains("strict_child"));
}

#[test]
fn self_recursive_flow_calls_hit_the_depth_limit() {
    let engine = FlowEngine::new(catalog(vec![flow_yaml(
        r#"
id: ouroboros
steps:
  - id: again
    type: flow_call
    flow_id: ouroboros
"#,
    )]))
    .with_config(EngineConfig {
        max_flow_depth: 4,
        ..EngineConfig::default()
    });

    let error = engine.execute("ouroboros", Map::new(), &FlowCallbacks::new()).unwrap_err();
    assert_eq!(error.kind, ErrorKind::RecursionLimit);
}

#[test]
fn retrying_scheduler_retries_dice_steps() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = FlowEngine::new(catalog(vec![flow_yaml(
        r#"
id: lucky
outputs:
  - id: total
    type: int
steps:
  - id: roll
    type: dice_roll
    roll: 2d6
    actions:
      - set_value: {path: outputs.total, value: "{{ result.total }}"}
"#,
    )]))
    .with_dice_roller(FlakyDice {
        failures: 2,
        total: 7,
        calls: calls.clone(),
    })
    .with_scheduler(RetryingScheduler::new(3));

    let outputs = engine.execute("lucky", Map::new(), &FlowCallbacks::new()).expect("run");
    assert_eq!(outputs["total"], json!(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn retrying_scheduler_never_replays_flow_calls() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = FlowEngine::new(catalog(vec![
        flow_yaml(
            r#"
id: cursed_roll
steps:
  - id: roll
    type: dice_roll
    roll: 1d20
"#,
        ),
        flow_yaml(
            r#"
id: caller
steps:
  - id: call
    type: flow_call
    flow_id: cursed_roll
"#,
        ),
    ]))
    .with_dice_roller(FlakyDice {
        failures: usize::MAX,
        total: 1,
        calls: calls.clone(),
    })
    .with_scheduler(RetryingScheduler::new(3));

    let error = engine.execute("caller", Map::new(), &FlowCallbacks::new()).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Collaborator);
    // Only the inner dice step is retried; the flow_call runs once.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn dice_sequence_exposes_item_and_result_to_its_actions() {
    let engine = FlowEngine::new(catalog(vec![flow_yaml(
        r#"
id: abilities
variables:
  - id: stats
    type: dict
outputs:
  - id: stats
    type: dict
steps:
  - id: roll_stats
    type: dice_sequence
    sequence:
      items: [strength, wisdom]
      roll: 3d6
      actions:
        - set_value: {path: "variables.stats.{{ item }}", value: "{{ result.total }}"}
  - id: publish
    type: completion
    actions:
      - set_value: {path: outputs.stats, value: "{{ variables.stats }}"}
"#,
    )]))
    .with_dice_roller(FixedDice::new(11));

    let outputs = engine.execute("abilities", Map::new(), &FlowCallbacks::new()).expect("run");
    assert_eq!(outputs["stats"], json!({"strength": 11, "wisdom": 11}));
}

#[test]
fn dice_steps_fail_without_a_dice_roller() {
    let engine = FlowEngine::new(catalog(vec![flow_yaml(
        r#"
id: no_dice
steps:
  - id: roll
    type: dice_roll
    roll: 1d4
"#,
    )]));

    let error = engine.execute("no_dice", Map::new(), &FlowCallbacks::new()).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Collaborator);
    assert!(std::error::Error::source(&error).is_some());
}

#[test]
fn name_generation_falls_back_to_configured_defaults() {
    let names = RecordingNames::default();
    let requests = names.requests.clone();
    let engine = FlowEngine::new(catalog(vec![flow_yaml(
        r#"
id: naming
outputs:
  - id: name
    type: str
steps:
  - id: name_npc
    type: name_generation
    settings:
      corpus: elvish
      max_length: "{{ 6 + 6 }}"
    actions:
      - set_value: {path: outputs.name, value: "{{ result.name }}"}
"#,
    )]))
    .with_name_generator(names);

    let outputs = engine.execute("naming", Map::new(), &FlowCallbacks::new()).expect("run");
    assert_eq!(outputs["name"], json!("Thalindra"));

    let requests = requests.lock().expect("requests lock");
    let (spec, max_length, algorithm) = &requests[0];
    assert_eq!(spec.corpus, "elvish");
    assert_eq!(spec.segmenter, "fantasy");
    assert_eq!(*max_length, 12);
    assert_eq!(algorithm, "bayesian");
}

#[test]
fn llm_generation_formats_the_prompt_and_layers_settings() {
    let catalog = catalog(vec![flow_yaml(
        r#"
id: tavern
inputs:
  - id: town
    type: str
outputs:
  - id: description
    type: str
steps:
  - id: describe
    type: llm_generation
    prompt_id: describe_tavern
    prompt_data:
      town: "{{ inputs.town }}"
    llm_settings:
      model: tiny-bard
    actions:
      - set_value: {path: outputs.description, value: "{{ result }}"}
"#,
    )])
    .with_prompt(PromptDefinition {
        id: "describe_tavern".into(),
        prompt_template: "Describe a tavern in {town}.".into(),
        ..Default::default()
    });
    let engine = FlowEngine::new(catalog).with_llm_client(MockLlmClient);

    let outputs = engine
        .execute("tavern", inputs(json!({"town": "Saltmarsh"})), &FlowCallbacks::new())
        .expect("run");
    let description = outputs["description"].as_str().expect("text");
    assert!(description.starts_with("[MOCK RESPONSE]"), "{description}");
    assert!(description.contains("contained 5 words"), "{description}");
    assert!(description.ends_with("generated by tiny-bard."), "{description}");
}

#[test]
fn llm_prompts_with_missing_data_fail_as_template_errors() {
    let catalog = catalog(vec![flow_yaml(
        r#"
id: vague
steps:
  - id: describe
    type: llm_generation
    prompt_id: describe_tavern
"#,
    )])
    .with_prompt(PromptDefinition {
        id: "describe_tavern".into(),
        prompt_template: "Describe a tavern in {town}.".into(),
        ..Default::default()
    });
    let engine = FlowEngine::new(catalog).with_llm_client(MockLlmClient);

    let error = engine.execute("vague", Map::new(), &FlowCallbacks::new()).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Template);
    assert!(error.message.contains("town"));
}

#[test]
fn unknown_tables_and_prompts_are_not_found() {
    let engine = FlowEngine::new(catalog(vec![
        flow_yaml(
            r#"
id: missing_table
steps:
  - id: roll
    type: table_roll
    tables:
      - table: nonexistent
"#,
        ),
        flow_yaml(
            r#"
id: missing_prompt
steps:
  - id: describe
    type: llm_generation
    prompt_id: nonexistent
"#,
        ),
    ]))
    .with_dice_roller(FixedDice::new(3));

    for flow_id in ["missing_table", "missing_prompt"] {
        let error = engine.execute(flow_id, Map::new(), &FlowCallbacks::new()).unwrap_err();
        assert_eq!(error.kind, ErrorKind::NotFound, "{flow_id}");
        assert!(error.message.contains("nonexistent"), "{flow_id}");
    }
}

#[test]
fn nested_actions_report_through_on_action_execute() {
    let herald = flow_yaml(
        r#"
id: herald
steps:
  - id: shout
    type: completion
    actions:
      - log_message: "the herald speaks"
"#,
    );
    let pageant = flow_yaml(
        r#"
id: pageant
steps:
  - id: roll_stats
    type: dice_sequence
    sequence:
      items: [strength]
      roll: 3d6
      actions:
        - set_value: {path: "variables.{{ item }}", value: "{{ result.total }}"}
  - id: loot
    type: table_roll
    tables:
      - table: treasure
        actions:
          - display_message: "found {{ result.entry }}"
  - id: choose
    type: player_choice
    prompt: "Which way?"
    choices:
      - id: left
        label: Left
        actions:
          - log_message: "went left"
      - id: right
        label: Right
  - id: judge
    type: conditional_branch
    if: "{{ variables.strength > 5 }}"
    then:
      - display_value: variables.strength
    else:
      - log_message: "weak"
  - id: doubt
    type: conditional_branch
    if: "{{ variables.strength > 50 }}"
    then:
      - log_message: "titanic"
    else:
      if: "{{ variables.strength > 5 }}"
      then:
        - log_event: {type: "verdict", data: {strength: "{{ variables.strength }}"}}
  - id: summon
    type: flow_call
    flow_id: herald
    actions:
      - display_message: "the herald is done"
"#,
    );
    let catalog = catalog(vec![herald, pageant]).with_table(table_yaml(
        r#"
id: treasure
roll: 1d20
entries:
  - {range: "1-20", value: gold}
"#,
    ));
    let engine = FlowEngine::new(catalog).with_dice_roller(FixedDice::new(11));

    let actions = RefCell::new(Vec::new());
    let callbacks = FlowCallbacks::new()
        .on_user_input(|_, _| Ok(json!("Left")))
        .on_action_execute(|action_type, data| actions.borrow_mut().push((action_type.to_string(), data.clone())));
    engine.execute("pageant", Map::new(), &callbacks).expect("run");
    drop(callbacks);

    let actions = actions.into_inner();
    let types: Vec<&str> = actions.iter().map(|(action_type, _)| action_type.as_str()).collect();
    assert_eq!(
        types,
        [
            "set_value",
            "display_message",
            "log_message",
            "display_value",
            "log_event",
            "log_message",
            "display_message",
        ]
    );
    assert_eq!(actions[1].1, json!({"message": "found gold"}));
    assert_eq!(actions[3].1, json!({"message": "variables.strength: 11"}));
}

#[test]
fn retried_steps_run_their_pre_actions_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = FlowEngine::new(catalog(vec![flow_yaml(
        r#"
id: omen
outputs:
  - id: total
    type: int
steps:
  - id: roll
    type: dice_roll
    roll: 1d20
    pre_actions:
      - display_message: "the dice are cast"
    actions:
      - set_value: {path: outputs.total, value: "{{ result.total }}"}
"#,
    )]))
    .with_dice_roller(FlakyDice {
        failures: 2,
        total: 17,
        calls: calls.clone(),
    })
    .with_scheduler(RetryingScheduler::new(5));

    let actions = RefCell::new(Vec::new());
    let callbacks = FlowCallbacks::new().on_action_execute(|action_type, _| actions.borrow_mut().push(action_type.to_string()));
    let outputs = engine.execute("omen", Map::new(), &callbacks).expect("run");
    drop(callbacks);

    assert_eq!(outputs["total"], json!(17));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(actions.into_inner(), ["display_message", "set_value"]);
}
