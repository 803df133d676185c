//! 编排器：驱动单次运行的状态机
//!
//! INGESTING → INTENT_CLASSIFIED → PLANNED → RETRIEVING（并行）→ REASONING → GATING
//! → {AUTO_RESPONDING | ESCALATING} → DONE。
//!
//! 同步路径整体受 run_timeout 约束，并可被调用方取消或断开；致命错误发出终止 error 事件后直接进入 DONE。
//! 进入 DONE 后才调度后台任务（写回上下文、长期记忆、摘要），不在交付结果的关键路径上。

use std::sync::Arc;
use std::time::Instant;

use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorSection;
use crate::core::{
    DetachedTaskError, DetachedTaskKind, PipelineError, RecoveryAction, RecoveryEngine, RunState, RunStateMachine,
    RunSupervisor, TaskSupervisor,
};
use crate::memory::{ContextStore, MemoryRecord, MemoryScope, MemoryStore, MemoryTier, Message, Summarizer};
use crate::pipeline::{
    ingest, EscalationPacket, EscalationReason, EscalationSink, EventKind, EventStreamer, IntentClassifier, Persona,
    Planner, Reasoner, RunContext, RunIds, SafetyGate, StreamEvent, Verdict,
};
use crate::retrieval::AgentExecutor;
use crate::workflow::fan_out;

/// 一次查询
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub message: String,
    pub persona: Persona,
}

impl QueryRequest {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            message: message.into(),
            persona: Persona::default(),
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }
}

pub type RunResult = Result<Verdict, PipelineError>;

/// 运行句柄：有序事件流 + 终止结果；丢弃事件接收端视为调用方断开
pub struct RunHandle {
    run_id: String,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    outcome: oneshot::Receiver<RunResult>,
    supervisor: RunSupervisor,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 下一个事件；运行结束且事件耗尽后返回 None
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// 取消运行（检索任务随之取消，已调度的后台任务不受影响）
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    /// 用于外部取消（如 HTTP 连接关闭）
    pub fn cancel_token(&self) -> CancellationToken {
        self.supervisor.cancel_token()
    }

    /// 丢弃剩余事件并等待终止结果
    pub async fn outcome(mut self) -> RunResult {
        while self.events.recv().await.is_some() {}
        self.outcome.await.unwrap_or_else(|_| {
            tracing::error!(run_id = %self.run_id, "Run task ended without delivering an outcome");
            Err(PipelineError::Cancelled)
        })
    }

    /// 转为事件流（不再关心终止结果时使用；终止结果也在最后一个事件中）
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures_util::stream::unfold(self.events, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) })
    }
}

/// 编排器各协作者（由 OrchestratorBuilder 组装）
pub struct OrchestratorParts {
    pub settings: OrchestratorSection,
    pub context_store: Arc<dyn ContextStore>,
    pub memory: Arc<dyn MemoryStore>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub planner: Planner,
    pub executor: AgentExecutor,
    pub reasoner: Arc<dyn Reasoner>,
    pub gate: SafetyGate,
    pub escalation: Arc<dyn EscalationSink>,
    pub summarizer: Arc<dyn Summarizer>,
    pub supervisor: TaskSupervisor,
}

/// 编排器（可 Clone，多个运行并发共享只读配置与适配器）
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    parts: OrchestratorParts,
    recovery: RecoveryEngine,
}

impl Orchestrator {
    pub fn from_parts(parts: OrchestratorParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                parts,
                recovery: RecoveryEngine::new(),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSection {
        &self.inner.parts.settings
    }

    /// 后台任务监管器（诊断用）
    pub fn tasks(&self) -> &TaskSupervisor {
        &self.inner.parts.supervisor
    }

    /// 启动一次运行，立即返回句柄；运行在独立任务中推进
    pub fn start_run(&self, query: QueryRequest) -> RunHandle {
        let run_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let supervisor = RunSupervisor::new();
        supervisor.watch_disconnect(tx.clone());

        let inner = Arc::clone(&self.inner);
        let run_supervisor = supervisor.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            let result = inner.execute(id, query, tx, run_supervisor).await;
            let _ = outcome_tx.send(result);
        });

        RunHandle {
            run_id,
            events: rx,
            outcome: outcome_rx,
            supervisor,
        }
    }

    /// 流式入口：返回事件流句柄
    pub fn submit_query(
        &self,
        user_id: &str,
        conversation_id: &str,
        message: &str,
        persona: Persona,
    ) -> RunHandle {
        self.start_run(QueryRequest::new(user_id, conversation_id, message).with_persona(persona))
    }

    /// 非流式入口：阻塞到 DONE，只返回终止结果
    pub async fn submit_query_blocking(
        &self,
        user_id: &str,
        conversation_id: &str,
        message: &str,
        persona: Persona,
    ) -> RunResult {
        self.submit_query(user_id, conversation_id, message, persona)
            .outcome()
            .await
    }
}

impl Inner {
    async fn execute(
        &self,
        run_id: String,
        query: QueryRequest,
        tx: mpsc::UnboundedSender<StreamEvent>,
        supervisor: RunSupervisor,
    ) -> RunResult {
        let settings = &self.parts.settings;
        let started = Instant::now();
        let mut events = EventStreamer::new(run_id.clone(), tx);
        let mut machine = RunStateMachine::new();
        let mut ctx = RunContext::new(
            RunIds {
                run_id: run_id.clone(),
                user_id: query.user_id.clone(),
                conversation_id: query.conversation_id.clone(),
                turn: 1,
            },
            query.persona,
            settings.window_size,
        );
        tracing::info!(
            run_id = %run_id,
            user_id = %query.user_id,
            conversation_id = %query.conversation_id,
            "Run started"
        );

        let cancel = supervisor.cancel_token();
        let run_timeout = settings.run_timeout();
        let mut user_appended = None;
        let driven = {
            let drive = self.drive(&query, &mut ctx, &mut machine, &mut events, &cancel, &mut user_appended);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                r = tokio::time::timeout(run_timeout, drive) => {
                    r.unwrap_or(Err(PipelineError::RunTimeout(run_timeout)))
                }
            }
        };
        // 超时路径下确保在途检索任务收到取消
        if matches!(driven, Err(PipelineError::RunTimeout(_))) {
            supervisor.cancel();
        }

        let result = match driven {
            Ok(verdict) => {
                events.emit(EventKind::Final {
                    verdict: verdict.clone(),
                });
                if let Err(e) = machine.advance(RunState::Done) {
                    tracing::error!(run_id = %run_id, error = %e, "Illegal transition to done");
                }
                tracing::info!(
                    run_id = %run_id,
                    verdict = ?verdict.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Run completed"
                );
                self.detach_post_run(&ctx, &verdict, user_appended.take());
                Ok(verdict)
            }
            Err(e) => {
                let stage = machine.current();
                tracing::warn!(
                    run_id = %run_id,
                    stage = %stage,
                    error = %e,
                    action = ?self.recovery.handle(&e),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Run aborted"
                );
                events.emit(EventKind::Error {
                    stage,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    fatal: true,
                    agent: None,
                });
                if let Err(te) = machine.abort() {
                    tracing::error!(run_id = %run_id, error = %te, "Illegal abort transition");
                }
                Err(e)
            }
        };
        supervisor.finish();
        result
    }

    /// 同步路径：INGESTING 至 AUTO_RESPONDING / ESCALATING，返回裁决（final 事件由调用方发出）
    async fn drive(
        &self,
        query: &QueryRequest,
        ctx: &mut RunContext,
        machine: &mut RunStateMachine,
        events: &mut EventStreamer,
        cancel: &CancellationToken,
        user_appended: &mut Option<oneshot::Receiver<()>>,
    ) -> RunResult {
        let parts = &self.parts;

        // INGESTING
        events.stage_started(RunState::Ingesting);
        let seed = parts
            .context_store
            .load(&query.conversation_id, parts.settings.window_size)
            .await
            .map_err(|e| PipelineError::Ingestion(format!("context store load failed: {e}")))?;
        ctx.hydrate(seed);
        let case = ingest(&query.message, &query.user_id, query.persona)?;
        ctx.push_user_message(&case.normalized);
        let user_message = Message::user(case.normalized.clone());
        *user_appended = Some(self.detach_user_append(&ctx.ids, user_message));
        ctx.case = Some(case);
        events.stage_finished(RunState::Ingesting);

        // INTENT_CLASSIFIED
        enter(machine, events, RunState::IntentClassified)?;
        let intent = {
            let case = ctx
                .case
                .as_ref()
                .ok_or_else(|| PipelineError::Ingestion("case missing after ingestion".to_string()))?;
            parts.classifier.classify(case).await?
        };
        ctx.scratchpad.note(
            RunState::IntentClassified,
            format!("{} / {:?} / sla_risk={}", intent.issue.as_str(), intent.severity, intent.sla_risk),
        );
        ctx.intent = Some(intent.clone());
        events.stage_finished(RunState::IntentClassified);

        // PLANNED
        enter(machine, events, RunState::Planned)?;
        let plan = parts.planner.plan(&intent, ctx)?;
        let planned: Vec<&str> = plan.agents().iter().map(|a| a.as_str()).collect();
        ctx.scratchpad
            .note(RunState::Planned, format!("agents: [{}]", planned.join(", ")));
        ctx.plan = Some(plan.clone());
        events.stage_finished(RunState::Planned);

        // RETRIEVING
        enter(machine, events, RunState::Retrieving)?;
        let request = ctx
            .retrieval_request()
            .ok_or_else(|| PipelineError::Planning("run context incomplete for retrieval".to_string()))?;
        let bundle = fan_out(&parts.executor, plan.agents(), Arc::new(request), cancel, events).await?;
        for e in bundle.failures() {
            let action = self.recovery.handle(&PipelineError::Retrieval(e.clone()));
            debug_assert_eq!(action, RecoveryAction::DegradeEvidence);
            ctx.scratchpad.add_failure(e.to_string());
        }
        ctx.scratchpad.note(
            RunState::Retrieving,
            format!(
                "{} item(s) from {}/{} agent(s)",
                bundle.item_count(),
                bundle.succeeded_agents(),
                bundle.len()
            ),
        );
        events.stage_finished(RunState::Retrieving);

        // REASONING
        enter(machine, events, RunState::Reasoning)?;
        let candidate = parts.reasoner.synthesize(bundle, ctx).await?;
        ctx.scratchpad.note(
            RunState::Reasoning,
            format!("confidence {:.2}", candidate.confidence),
        );
        events.stage_finished(RunState::Reasoning);

        // GATING
        enter(machine, events, RunState::Gating)?;
        let confidence = candidate.confidence;
        let verdict = match parts.gate.evaluate(candidate, ctx).await {
            Ok(verdict) => verdict,
            Err(e) => match self.recovery.handle(&e) {
                RecoveryAction::Escalate => {
                    tracing::warn!(run_id = %ctx.ids.run_id, error = %e, "Safety gate failed, escalating");
                    events.emit(EventKind::Error {
                        stage: RunState::Gating,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        fatal: false,
                        agent: None,
                    });
                    let mut packet = EscalationPacket::new(
                        EscalationReason::GateFailure { message: e.to_string() },
                        None,
                        ctx,
                    );
                    packet.confidence = Some(confidence);
                    Verdict::Escalate { packet }
                }
                _ => return Err(e),
            },
        };
        events.stage_finished(RunState::Gating);

        match verdict {
            Verdict::AutoRespond { candidate } => {
                enter(machine, events, RunState::AutoResponding)?;
                events.stage_finished(RunState::AutoResponding);
                Ok(Verdict::AutoRespond { candidate })
            }
            Verdict::Escalate { mut packet } => {
                enter(machine, events, RunState::Escalating)?;
                tracing::info!(run_id = %ctx.ids.run_id, reason = %packet.reason, severity = packet.severity, "Escalating");
                packet.ticket = self.submit_escalation(&packet, &ctx.ids.run_id).await;
                events.stage_finished(RunState::Escalating);
                Ok(Verdict::Escalate { packet })
            }
        }
    }

    /// 提交升级包；失败只记日志，工单号为 None
    async fn submit_escalation(&self, packet: &EscalationPacket, run_id: &str) -> Option<String> {
        let limit = self.parts.settings.agent_timeout();
        match tokio::time::timeout(limit, self.parts.escalation.submit(packet)).await {
            Ok(Ok(ticket)) => Some(ticket),
            Ok(Err(e)) => {
                tracing::warn!(run_id = %run_id, error = %e, "Escalation sink rejected packet");
                None
            }
            Err(_) => {
                tracing::warn!(run_id = %run_id, timeout_ms = limit.as_millis() as u64, "Escalation sink timed out");
                None
            }
        }
    }

    /// 写回本轮用户消息；返回的接收端在写入结束（无论成败）后就绪，回复写回需排在其后
    fn detach_user_append(&self, ids: &RunIds, message: Message) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let store = Arc::clone(&self.parts.context_store);
        let conversation_id = ids.conversation_id.clone();
        self.parts.supervisor.detach(
            DetachedTaskKind::ContextAppend,
            format!("append user message to {conversation_id}"),
            async move {
                let result = store
                    .append(&conversation_id, message)
                    .await
                    .map_err(|e| DetachedTaskError::new("context_append", e));
                let _ = done_tx.send(());
                result
            },
        );
        done_rx
    }

    /// DONE 之后的副作用：写回回复（并按需摘要）、长期记忆；各任务相互独立
    fn detach_post_run(
        &self,
        ctx: &RunContext,
        verdict: &Verdict,
        user_appended: Option<oneshot::Receiver<()>>,
    ) {
        let parts = &self.parts;
        let reply = verdict.reply_text();
        self.detach_write_back(ctx, reply, user_appended);

        let issue = ctx.intent.as_ref().map_or("other", |i| i.issue.as_str());
        let query = ctx.query().to_string();
        let outcome = match verdict {
            Verdict::AutoRespond { candidate } => {
                format!("answered automatically (confidence {:.2})", candidate.confidence)
            }
            Verdict::Escalate { packet } => format!("escalated: {}", packet.reason),
        };

        let memory = Arc::clone(&parts.memory);
        let episodic = MemoryRecord::new(
            MemoryScope::User(ctx.ids.user_id.clone()),
            MemoryTier::Episodic,
            format!("[{issue}] {query} -> {outcome}"),
        );
        parts.supervisor.detach(
            DetachedTaskKind::MemoryWrite,
            format!("episodic memory for {}", ctx.ids.user_id),
            async move {
                memory
                    .write(episodic)
                    .await
                    .map_err(|e| DetachedTaskError::new("episodic_memory", e))
            },
        );

        if let Verdict::AutoRespond { candidate } = verdict {
            let memory = Arc::clone(&parts.memory);
            let semantic = MemoryRecord::new(
                MemoryScope::Application,
                MemoryTier::Semantic,
                format!("[{issue}] {query} => {}", candidate.answer),
            );
            parts.supervisor.detach(
                DetachedTaskKind::MemoryWrite,
                "semantic memory for application",
                async move {
                    memory
                        .write(semantic)
                        .await
                        .map_err(|e| DetachedTaskError::new("semantic_memory", e))
                },
            );
        }
    }

    /// 回复写回与摘要放在同一任务中串行执行：先等用户消息落盘，再追加回复，最后按需替换摘要
    fn detach_write_back(
        &self,
        ctx: &RunContext,
        reply: String,
        user_appended: Option<oneshot::Receiver<()>>,
    ) {
        let parts = &self.parts;
        let store = Arc::clone(&parts.context_store);
        let conversation_id = ctx.ids.conversation_id.clone();
        let reply = Message::assistant(reply);

        // 距上次摘要的新消息：窗口末尾的 messages_since_summary 条加上本轮回复
        let pending = ctx.messages_since_summary + 1;
        let to_summarize = (pending >= parts.settings.summarize_every.max(1)).then(|| {
            let window = ctx.window.messages();
            let fresh = ctx.messages_since_summary.min(window.len());
            let mut messages = window[window.len() - fresh..].to_vec();
            messages.push(reply.clone());
            (Arc::clone(&parts.summarizer), ctx.summary.clone(), messages)
        });
        let (kind, label) = if to_summarize.is_some() {
            (
                DetachedTaskKind::Summarization,
                format!("append reply and summarize {conversation_id}"),
            )
        } else {
            (
                DetachedTaskKind::ContextAppend,
                format!("append assistant message to {conversation_id}"),
            )
        };

        let after = async move {
            if let Some(rx) = user_appended {
                let _ = rx.await;
            }
        };
        parts.supervisor.detach_after(after, kind, label, async move {
            store
                .append(&conversation_id, reply)
                .await
                .map_err(|e| DetachedTaskError::new("context_append", e))?;
            if let Some((summarizer, previous, messages)) = to_summarize {
                let summary = summarizer
                    .summarize(previous.as_deref(), &messages)
                    .await
                    .map_err(|e| DetachedTaskError::new("summarization", e))?;
                store
                    .replace_summary(&conversation_id, summary)
                    .await
                    .map_err(|e| DetachedTaskError::new("summarization", e))?;
            }
            Ok(())
        });
    }
}

/// 沿顺序边进入下一状态并发出 stage_started
fn enter(machine: &mut RunStateMachine, events: &mut EventStreamer, state: RunState) -> Result<(), PipelineError> {
    machine.advance(state)?;
    events.stage_started(state);
    Ok(())
}
