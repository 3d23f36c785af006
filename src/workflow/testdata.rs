//! Shared YAML fixtures for workflow tests.

/// Three-step linear pipeline: data_preprocess -> main -> validate.
pub(crate) const RUN_YAML: &str = r#"
name: distributed_training
desc: sample pipeline for distributed training
docker_env: registry.example.com/train:1.2

entry_points:
  data_preprocess:
    command: "python data_preprocess.py --input {{ data_path }} --output {{ train_data }}"
    parameters:
      data_path: /data/raw
    artifacts:
      output:
        train_data: /out/train_data
        validate_data: /out/validate_data

  main:
    command: "python train.py --data {{ train_data }} --model {{ model }}"
    deps: data_preprocess
    parameters:
      model: ./model/dnn
      train_stage: "{{ data_preprocess.data_path }}"
      p3:
        type: string
        default: dictparam
      p4:
        type: float
        default: 0.66
      p5:
        type: path
        default: /path/to/anywhere
    env:
      PS_NUM: "2"
      WORKER_NUM: "2"
    artifacts:
      input:
        train_data: "{{ data_preprocess.train_data }}"
      output:
        train_model: /out/model
    cache:
      enable: true
      max_expired_time: 600

  validate:
    command: "python validate.py --model {{ main.train_model }}"
    deps: main
    parameters:
      refSystem: "{{ PF_RUN_ID }}"
    artifacts:
      input:
        data: "{{ data_preprocess.validate_data }}"
        model: "{{ main.train_model }}"
"#;

/// Same shape with a cycle: validate feeds back into data_preprocess.
pub(crate) const RUN_CIRCLE_YAML: &str = r#"
name: circular_training
entry_points:
  data_preprocess:
    command: "python data_preprocess.py"
    deps: validate

  main:
    command: "python train.py"
    deps: data_preprocess

  validate:
    command: "python validate.py"
    deps: main
"#;

/// Pipeline whose `main` step carries an invalid reference; the
/// data_preprocess subgraph is still valid on its own.
pub(crate) const RUN_WRONG_PARAM_YAML: &str = r#"
name: wrong_param_training
entry_points:
  data_preprocess:
    command: "python data_preprocess.py"
    parameters:
      data_path: /data/raw

  main:
    command: "python train.py"
    deps: data_preprocess
    parameters:
      bogus: "{{ nowhere.nothing }}"

  validate:
    command: "python validate.py"
    deps: main
"#;
