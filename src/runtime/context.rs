use std::{
    rc::{Rc, Weak},
    time::Instant,
};

use super::{Frame, Namespace};
use crate::{interface::Context, options::TemplateOptions};

/// Calls nested deeper than this fail with a recursion error.
pub(crate) const MAX_DEPTH: usize = 200;

/// Free stack below which a call moves onto a freshly allocated segment.
pub(crate) const STACK_RED_ZONE: usize = 128 * 1024;

/// Size of each stack segment allocated for deep call chains.
pub(crate) const STACK_SEGMENT: usize = 2 * 1024 * 1024;

/// Mutable state owned by one render call.
pub(crate) struct RenderState<'a> {
    pub(crate) data: &'a Context,
    pub(crate) options: TemplateOptions,
    pub(crate) started: Instant,
    pub(crate) depth: usize,
    buffers: Vec<String>,
    /// One entry per active definition call: the `caller` it sees.
    caller_stack: Vec<Option<Rc<Namespace>>>,
    /// Set by `<%call>` for the next definition invoked.
    next_caller: Option<Rc<Namespace>>,
    frames: Vec<Weak<Frame>>,
    frames_compacted_at: usize,
    namespaces: Vec<Weak<Namespace>>,
}

impl<'a> RenderState<'a> {
    pub(crate) fn new(data: &'a Context, options: TemplateOptions) -> Self {
        Self {
            data,
            options,
            started: Instant::now(),
            depth: 0,
            buffers: vec![String::new()],
            caller_stack: Vec::new(),
            next_caller: None,
            frames: Vec::new(),
            frames_compacted_at: 64,
            namespaces: Vec::new(),
        }
    }

    pub(crate) fn write(&mut self, text: &str) {
        if let Some(buffer) = self.buffers.last_mut() {
            buffer.push_str(text);
        }
    }

    pub(crate) fn push_buffer(&mut self) {
        self.buffers.push(String::new());
    }

    pub(crate) fn pop_buffer(&mut self) -> String {
        if self.buffers.len() > 1 {
            self.buffers.pop().unwrap_or_default()
        } else {
            String::new()
        }
    }

    /// The root buffer's contents.
    pub(crate) fn take_output(&mut self) -> String {
        let output = self.buffers.concat();
        self.buffers = vec![String::new()];
        output
    }

    pub(crate) fn caller(&self) -> Option<Rc<Namespace>> {
        self.caller_stack.last().cloned().flatten()
    }

    pub(crate) fn push_caller(&mut self, caller: Option<Rc<Namespace>>) {
        self.caller_stack.push(caller);
    }

    pub(crate) fn pop_caller(&mut self) {
        self.caller_stack.pop();
    }

    pub(crate) fn set_next_caller(&mut self, caller: Option<Rc<Namespace>>) {
        self.next_caller = caller;
    }

    pub(crate) fn take_next_caller(&mut self) -> Option<Rc<Namespace>> {
        self.next_caller.take()
    }

    /// Creates a frame that is released when the render finishes.
    pub(crate) fn new_frame(&mut self, parent: Option<Rc<Frame>>) -> Rc<Frame> {
        let frame = Frame::new(parent);
        if self.frames.len() >= self.frames_compacted_at {
            self.frames.retain(|frame| frame.strong_count() > 0);
            self.frames_compacted_at = (self.frames.len() * 2).max(64);
        }
        self.frames.push(Rc::downgrade(&frame));
        frame
    }

    pub(crate) fn track_namespace(&mut self, ns: &Rc<Namespace>) {
        self.namespaces.push(Rc::downgrade(ns));
    }
}

impl Drop for RenderState<'_> {
    fn drop(&mut self) {
        self.caller_stack.clear();
        self.next_caller = None;
        for ns in self.namespaces.drain(..).filter_map(|ns| ns.upgrade()) {
            ns.release();
        }
        for frame in self.frames.drain(..).filter_map(|frame| frame.upgrade()) {
            frame.clear();
        }
    }
}
