use clap::{
    builder::PossibleValuesParser,
    parser::ValueSource,
    Arg, ArgAction, ArgMatches, Command,
};
use nagare::{Argument, ArgumentAction, OptionValue, Session};

/// Turns a plugin argument into a clap argument, driven by the parser keywords
/// of [`Argument::options`].
fn clap_arg(plugin: &str, argument: &Argument) -> Arg {
    let options = argument.options();
    let long = argument.argument_name(plugin).trim_start_matches('-').to_string();
    let mut arg = Arg::new(argument.namespace_dest(plugin)).long(long);

    arg = match options.get("action").and_then(OptionValue::as_str) {
        Some("store_true") | Some("store_const") => arg.action(ArgAction::SetTrue),
        Some("store_false") => arg.action(ArgAction::SetFalse),
        Some("count") => arg.action(ArgAction::Count),
        Some("append") => arg.action(ArgAction::Append),
        _ => arg.action(ArgAction::Set),
    };

    match options.get("nargs") {
        Some(OptionValue::Int(n)) => arg = arg.num_args(usize::try_from(*n).unwrap_or(1)),
        Some(OptionValue::Str(nargs)) => {
            arg = match nargs.as_str() {
                "?" => arg.num_args(0..=1),
                "*" => arg.num_args(0..),
                _ => arg.num_args(1..),
            }
        }
        _ => {}
    }

    if let Some(help) = options.get("help").and_then(OptionValue::as_str) {
        arg = arg.help(help.to_string());
    }
    if let Some(choices) = options.get("choices").and_then(OptionValue::as_list) {
        arg = arg.value_parser(PossibleValuesParser::new(choices.to_vec()));
    }
    if let Some(metavar) = options.get("metavar").and_then(OptionValue::as_list) {
        arg = arg.value_names(metavar.to_vec());
    }
    if let Some(default) = options.get("default") {
        arg = arg.long_help(format!(
            "{}\n\nDefault: {default}",
            argument.help().unwrap_or_default()
        ));
    }
    arg
}

pub fn augment(mut command: Command, session: &Session) -> Command {
    for (plugin, arguments) in session.plugin_arguments() {
        if arguments.is_empty() {
            continue;
        }
        command = command.next_help_heading(format!("Plugin {plugin}"));
        for argument in arguments.iter() {
            command = command.arg(clap_arg(plugin, argument));
        }
    }
    command
}

/// Stores every plugin argument given on the command line as a plugin option.
pub fn apply(matches: &ArgMatches, session: &Session) -> anyhow::Result<()> {
    for (plugin, arguments) in session.plugin_arguments() {
        for argument in arguments.iter() {
            let id = argument.namespace_dest(plugin);
            if matches.value_source(&id) != Some(ValueSource::CommandLine) {
                continue;
            }

            let value = match argument.action() {
                ArgumentAction::StoreTrue => OptionValue::Bool(true),
                ArgumentAction::StoreFalse => OptionValue::Bool(false),
                ArgumentAction::StoreConst => argument.const_value().clone(),
                ArgumentAction::Count => OptionValue::from(matches.get_count(&id) as u64),
                ArgumentAction::Store | ArgumentAction::Append => {
                    let raw: Vec<&String> = matches
                        .get_many::<String>(&id)
                        .map(Iterator::collect)
                        .unwrap_or_default();
                    let mut values = raw
                        .into_iter()
                        .map(|raw| argument.parse_value(raw))
                        .collect::<Result<Vec<_>, _>>()?;
                    if values.len() == 1 && argument.action() == ArgumentAction::Store {
                        values.remove(0)
                    } else {
                        OptionValue::List(values.iter().map(ToString::to_string).collect())
                    }
                }
            };
            log::debug!("Setting plugin option {} of {plugin}", argument.dest());
            session.set_plugin_option(plugin, &argument.dest(), value);
        }
    }
    Ok(())
}
