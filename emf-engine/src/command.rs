use std::collections::HashMap;

use emf_core::geometry::Point2;
use emf_core::graph::EntityClass;

use crate::editor::{Editor, InteractionMode};
use crate::errors::EngineError;

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// 解析前两个参数为光标坐标。
    fn cursor(&self) -> Option<Point2> {
        let x = self.args.first()?.parse().ok()?;
        let y = self.args.get(1)?.parse().ok()?;
        Some(Point2::new(x, y))
    }

    /// 第三个参数为可选开关（`shift`/`true`/`1`）。
    fn flag(&self) -> bool {
        self.args
            .get(2)
            .is_some_and(|arg| matches!(arg.as_str(), "shift" | "true" | "1"))
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }

    fn from_result(result: Result<String, EngineError>) -> Self {
        match result {
            Ok(message) => Self::ok(message),
            Err(err) => Self::err(err.to_string()),
        }
    }
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse;
}

pub struct CommandContext<'a> {
    pub editor: &'a mut Editor,
}

/// 按键名到处理器的映射。指针类命令以 `x y [开关]` 为参数。
pub struct CommandBus {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl CommandBus {
    pub fn new() -> Self {
        let mut bus = Self {
            handlers: HashMap::new(),
        };
        bus.register(SelectionTypeCommand("1", EntityClass::Node));
        bus.register(SelectionTypeCommand("2", EntityClass::Line));
        bus.register(SelectionTypeCommand("3", EntityClass::Shape));
        bus.register(BeginInteractionCommand("g", InteractionMode::Grab));
        bus.register(BeginInteractionCommand("r", InteractionMode::Rotate));
        bus.register(BeginInteractionCommand("s", InteractionMode::Scale));
        bus.register(SelectAllCommand);
        bus.register(DuplicateCommand);
        bus.register(ExtrudeCommand);
        bus.register(FormCommand);
        bus.register(DeleteCommand("x", false));
        bus.register(DeleteCommand("X", true));
        bus.register(FinishInteractionCommand("enter", true));
        bus.register(FinishInteractionCommand("escape", false));
        bus.register(PointerCommand::Select);
        bus.register(PointerCommand::Deselect);
        bus.register(PointerCommand::Move);
        bus.register(PointerCommand::AddNode);
        bus
    }

    pub fn register<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.name(), Box::new(handler));
    }

    pub fn dispatch(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if let Some(handler) = self.handlers.get(request.name.as_str()) {
            handler.execute(request, context)
        } else {
            CommandResponse::err(format!("未知命令: {}", request.name))
        }
    }

    pub fn available_commands(&self) -> impl Iterator<Item = &&'static str> {
        self.handlers.keys()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

struct SelectionTypeCommand(&'static str, EntityClass);

impl CommandHandler for SelectionTypeCommand {
    fn name(&self) -> &'static str {
        self.0
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if context.editor.set_selection_type(self.1) {
            CommandResponse::ok(format!("选择类别已切换为 {}", self.1))
        } else {
            CommandResponse::ok(format!("选择类别保持为 {}", context.editor.selection_type()))
        }
    }
}

struct BeginInteractionCommand(&'static str, InteractionMode);

impl CommandHandler for BeginInteractionCommand {
    fn name(&self) -> &'static str {
        self.0
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        CommandResponse::from_result(context.editor.begin_interaction(self.1).map(|started| {
            if started {
                format!("开始交互: {:?}", self.1)
            } else {
                "没有可变换的选择".to_string()
            }
        }))
    }
}

struct SelectAllCommand;

impl CommandHandler for SelectAllCommand {
    fn name(&self) -> &'static str {
        "a"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        CommandResponse::from_result(
            context
                .editor
                .select_all()
                .map(|count| format!("已选中 {count} 个实体")),
        )
    }
}

struct DuplicateCommand;

impl CommandHandler for DuplicateCommand {
    fn name(&self) -> &'static str {
        "d"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        CommandResponse::from_result(
            context
                .editor
                .duplicate_items()
                .map(|created| format!("已复制 {} 个实体", created.len())),
        )
    }
}

struct ExtrudeCommand;

impl CommandHandler for ExtrudeCommand {
    fn name(&self) -> &'static str {
        "e"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        CommandResponse::from_result(
            context
                .editor
                .extrude_items()
                .map(|created| format!("已挤出 {} 个实体", created.len())),
        )
    }
}

struct FormCommand;

impl CommandHandler for FormCommand {
    fn name(&self) -> &'static str {
        "f"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        CommandResponse::from_result(context.editor.form_item().map(|formed| match formed {
            Some(item) => format!("已组成 {}", item.class()),
            None => "当前选择无法组成新实体".to_string(),
        }))
    }
}

struct DeleteCommand(&'static str, bool);

impl CommandHandler for DeleteCommand {
    fn name(&self) -> &'static str {
        self.0
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        CommandResponse::from_result(
            context
                .editor
                .delete_items(self.1)
                .map(|removal| format!("已删除 {} 个实体", removal.len())),
        )
    }
}

struct FinishInteractionCommand(&'static str, bool);

impl CommandHandler for FinishInteractionCommand {
    fn name(&self) -> &'static str {
        self.0
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let result = if self.1 {
            context.editor.apply_interaction()
        } else {
            context.editor.cancel_interaction()
        };
        let verb = if self.1 { "应用" } else { "取消" };
        CommandResponse::from_result(result.map(|changed| {
            if changed {
                format!("已{verb}交互")
            } else {
                format!("已{verb}交互，位置未变化")
            }
        }))
    }
}

enum PointerCommand {
    Select,
    Deselect,
    Move,
    AddNode,
}

impl CommandHandler for PointerCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::Select => "click",
            Self::Deselect => "right_click",
            Self::Move => "move",
            Self::AddNode => "add",
        }
    }

    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let Some(cursor) = request.cursor() else {
            return CommandResponse::err(format!("命令 {} 需要坐标参数 x y", self.name()));
        };
        let flag = request.flag();
        let editor = &mut *context.editor;
        let result = match self {
            Self::Select => editor.select_at(cursor, flag).map(|hit| match hit {
                Some(item) => format!("已选中 {}", item.class()),
                None => "光标处没有可选实体".to_string(),
            }),
            Self::Deselect => editor.deselect_at(cursor, flag).map(|removed| match removed {
                Some(item) => format!("已取消选择 {}", item.class()),
                None if flag => "光标处没有已选实体".to_string(),
                None => "选择已清空".to_string(),
            }),
            Self::Move => editor
                .update_interaction(cursor, flag)
                .map(|changed| format!("光标移动到 ({}, {})，变化: {changed}", cursor.x(), cursor.y())),
            Self::AddNode => editor
                .add_node(cursor)
                .map(|node| format!("已新增节点 {}", node.get())),
        };
        CommandResponse::from_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emf_core::map::{Map, SQUARE_SIZE};

    fn run(bus: &CommandBus, editor: &mut Editor, name: &str, args: &[&str]) -> CommandResponse {
        let request = CommandRequest::with_args(name, args.iter().copied());
        bus.dispatch(&request, &mut CommandContext { editor })
    }

    fn demo() -> Editor {
        let mut editor = Editor::new(Map::with_squares(10, 10, SQUARE_SIZE, 1));
        editor.populate_demo().expect("demo");
        editor
    }

    #[test]
    fn unknown_command_is_reported() {
        let bus = CommandBus::new();
        let mut editor = demo();
        let response = run(&bus, &mut editor, "q", &[]);
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("未知命令: q"));
    }

    #[test]
    fn grab_through_keys_moves_selection() {
        let bus = CommandBus::new();
        let mut editor = demo();

        assert!(run(&bus, &mut editor, "click", &["72", "72"]).success);
        assert!(run(&bus, &mut editor, "g", &[]).success);
        assert_eq!(editor.interaction_mode(), InteractionMode::Grab);
        assert!(run(&bus, &mut editor, "move", &["100", "72", "shift"]).success);
        assert!(run(&bus, &mut editor, "enter", &[]).success);

        assert_eq!(editor.interaction_mode(), InteractionMode::Select);
        assert_eq!(editor.median(), Some(Point2::new(99, 72)));
    }

    #[test]
    fn escape_restores_positions() {
        let bus = CommandBus::new();
        let mut editor = demo();
        run(&bus, &mut editor, "a", &[]);
        run(&bus, &mut editor, "g", &[]);
        run(&bus, &mut editor, "move", &["50", "50"]);
        assert_eq!(editor.median(), Some(Point2::new(158, 158)));
        run(&bus, &mut editor, "escape", &[]);
        assert_eq!(editor.median(), Some(Point2::new(108, 108)));
    }

    #[test]
    fn selection_type_keys_and_delete() {
        let bus = CommandBus::new();
        let mut editor = demo();
        run(&bus, &mut editor, "2", &[]);
        assert_eq!(editor.selection_type(), EntityClass::Line);
        run(&bus, &mut editor, "click", &["108", "72"]);
        let response = run(&bus, &mut editor, "x", &[]);
        assert!(response.success);
        let layer = editor.layer().expect("layer");
        assert_eq!(layer.line_count(), 3);
        assert_eq!(layer.shape_count(), 0);
        assert_eq!(layer.node_count(), 4);
    }

    #[test]
    fn pointer_commands_need_coordinates() {
        let bus = CommandBus::new();
        let mut editor = demo();
        let response = run(&bus, &mut editor, "add", &["12"]);
        assert!(!response.success);
        assert!(run(&bus, &mut editor, "add", &["12", "30"]).success);
        assert_eq!(editor.selection_len(), 1);
        assert!(run(&bus, &mut editor, "right_click", &["0", "0"]).success);
        assert_eq!(editor.selection_len(), 0);
    }

    #[test]
    fn extreme_cursor_coordinates_clamp_instead_of_overflowing() {
        let bus = CommandBus::new();
        let mut editor = demo();
        run(&bus, &mut editor, "a", &[]);
        run(&bus, &mut editor, "g", &[]);
        let max = i32::MAX.to_string();
        let min = i32::MIN.to_string();
        assert!(run(&bus, &mut editor, "move", &[&max, &min]).success);
        assert!(run(&bus, &mut editor, "move", &[&min, &max, "shift"]).success);
        let median = editor.median().expect("median");
        assert!(median.x() < 0 && median.y() > 0);
        run(&bus, &mut editor, "escape", &[]);
        assert_eq!(editor.median(), Some(Point2::new(108, 108)));
        assert!(run(&bus, &mut editor, "click", &[&min, &min]).success);
    }

    #[test]
    fn every_key_is_registered() {
        let bus = CommandBus::new();
        for key in ["1", "2", "3", "g", "r", "s", "a", "d", "e", "f", "x", "X", "enter", "escape"] {
            assert!(bus.available_commands().any(|name| *name == key), "{key}");
        }
    }
}
