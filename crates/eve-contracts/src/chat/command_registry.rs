#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg: &'static str,
}

/// Commands whose whole remainder is one argument.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "lang",
        action: "set_language",
        arg: "language",
    },
    CommandSpec {
        command: "model",
        action: "set_model",
        arg: "model",
    },
    CommandSpec {
        command: "endpoint",
        action: "set_endpoint",
        arg: "endpoint",
    },
];

/// Commands taking a single (possibly quoted) token.
pub(crate) const SINGLE_TOKEN_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "attach",
        action: "attach",
        arg: "path",
    },
    CommandSpec {
        command: "reset",
        action: "reset_setting",
        arg: "field",
    },
    CommandSpec {
        command: "key_use",
        action: "key_use",
        arg: "id",
    },
    CommandSpec {
        command: "key_remove",
        action: "key_remove",
        arg: "id",
    },
    CommandSpec {
        command: "key_test",
        action: "key_test",
        arg: "id",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
        arg: "",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
        arg: "",
    },
    CommandSpec {
        command: "settings",
        action: "show_settings",
        arg: "",
    },
    CommandSpec {
        command: "keys",
        action: "list_keys",
        arg: "",
    },
    CommandSpec {
        command: "memories",
        action: "show_memories",
        arg: "",
    },
    CommandSpec {
        command: "context",
        action: "show_context",
        arg: "",
    },
    CommandSpec {
        command: "confirm",
        action: "confirm",
        arg: "",
    },
    CommandSpec {
        command: "cancel",
        action: "cancel",
        arg: "",
    },
    CommandSpec {
        command: "wipe",
        action: "wipe",
        arg: "",
    },
    CommandSpec {
        command: "wait",
        action: "wait",
        arg: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg: "",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
        arg: "",
    },
];

pub(crate) const SET_COMMAND: CommandSpec = CommandSpec {
    command: "set",
    action: "set_setting",
    arg: "field",
};

pub(crate) const KEY_ADD_COMMAND: CommandSpec = CommandSpec {
    command: "key_add",
    action: "key_add",
    arg: "label",
};

pub const CHAT_HELP_COMMANDS: &[(&str, &str)] = &[
    ("/help", "show this list"),
    ("/attach <path>", "attach an image to the next message"),
    ("/lang english|manglish", "switch persona language"),
    ("/confirm", "confirm a pending language switch or wipe"),
    ("/cancel", "cancel a pending language switch or wipe"),
    ("/model <id>", "select the chat model"),
    ("/models", "list known chat models"),
    ("/set <field> <value>", "change a generation setting"),
    ("/reset <field>", "restore a generation setting to its default"),
    ("/settings", "show generation settings"),
    ("/endpoint [url|clear]", "show, set or clear the image endpoint"),
    ("/key_add <label> <key>", "store an API key"),
    ("/key_use <id>", "make a stored key active"),
    ("/key_remove <id>", "delete a stored key"),
    ("/key_test <id>", "check that a stored key works"),
    ("/keys", "list stored keys"),
    ("/memories", "show long-term memories"),
    ("/context", "estimate context usage"),
    ("/wipe", "forget everything and start over"),
    ("/wait", "wait for pending images and memories"),
    ("/quit", "leave the chat"),
];
